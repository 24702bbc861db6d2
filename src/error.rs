//! Error handling module for installer-storage
//!
//! Provides centralized error handling with proper error types using thiserror.
//! The variants follow the failure classes of the storage core: enumeration,
//! policy violations, external tool failures and terminal problems.
//! Policy file problems are reported through `anyhow` in `config_file`.

use thiserror::Error;

use crate::passphrase::PassphraseRejection;

/// Main error type for the storage core
#[derive(Error, Debug)]
pub enum StorageError {
    /// The device inventory could not be listed (lsblk failed, bad JSON, permissions)
    #[error("Device enumeration failed: {0}")]
    Enumeration(String),

    /// A lifecycle or policy rule was violated before any external call was made
    #[error("Policy violation: {0}")]
    Policy(String),

    /// The supplied passphrase does not satisfy the passphrase policy
    #[error("Invalid passphrase: {0}")]
    InvalidPassphrase(#[from] PassphraseRejection),

    /// An external tool exited non-zero
    #[error("{operation} failed (exit code {}): {}", .exit_code.unwrap_or(-1), .output.trim())]
    Tool {
        operation: String,
        exit_code: Option<i32>,
        output: String,
    },

    /// A device name or handle that is not part of the forest
    #[error("Unknown block device: {0}")]
    UnknownDevice(String),

    /// Terminal mode could not be changed or restored
    #[error("Terminal error: {0}")]
    Terminal(String),

    /// IO errors (spawning tools, reading files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    /// Create an enumeration error
    pub fn enumeration(msg: impl Into<String>) -> Self {
        Self::Enumeration(msg.into())
    }

    /// Create a policy violation error
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy(msg.into())
    }

    /// Create an external tool failure carrying the captured output
    pub fn tool(operation: impl Into<String>, exit_code: Option<i32>, output: impl Into<String>) -> Self {
        Self::Tool {
            operation: operation.into(),
            exit_code,
            output: output.into(),
        }
    }

    /// Create a terminal error
    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    /// True for errors raised before any external process was started.
    pub fn is_policy(&self) -> bool {
        matches!(self, Self::Policy(_) | Self::InvalidPassphrase(_) | Self::UnknownDevice(_))
    }
}
