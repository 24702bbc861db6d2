//! Type-safe arguments for `cryptsetup`.
//!
//! - `LuksFormatArgs` for `cryptsetup luksFormat`
//! - `LuksOpenArgs` for `cryptsetup luksOpen`
//! - `LuksCloseArgs` for `cryptsetup luksClose`
//!
//! # Security Model
//!
//! **CRITICAL**: Passphrases are NEVER passed via CLI arguments (visible in `ps aux`)
//! or the environment. Format and open pass `-` as the key file, which makes
//! cryptsetup read the key from stdin; the runner writes it there.
//!
//! # LUKS Policy
//!
//! Hash, cipher and key size are fixed by `LuksParams::POLICY` and are not
//! user-tunable.

use std::fmt;
use std::path::PathBuf;

use crate::tool_args::ToolArgs;

/// Key file argument that tells cryptsetup to read the key from stdin
pub const STDIN_KEY_FILE: &str = "-";

/// Fixed LUKS parameters applied to every format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LuksParams {
    pub hash: &'static str,
    pub cipher: &'static str,
    /// Key size in bits. XTS splits it into two halves.
    pub key_size: u32,
}

impl LuksParams {
    pub const POLICY: LuksParams = LuksParams {
        hash: "sha256",
        cipher: "aes-xts-plain64",
        key_size: 512,
    };

    fn to_cli_args(self) -> Vec<String> {
        vec![
            format!("--hash={}", self.hash),
            format!("--cipher={}", self.cipher),
            format!("--key-size={}", self.key_size),
        ]
    }
}

impl Default for LuksParams {
    fn default() -> Self {
        Self::POLICY
    }
}

impl fmt::Display for LuksParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} / {}-bit", self.cipher, self.hash, self.key_size)
    }
}

/// Arguments for `cryptsetup luksFormat`.
///
/// | Rust Field | CLI | Notes |
/// |------------|-----|-------|
/// | `params`   | `--hash=`, `--cipher=`, `--key-size=` | Always `LuksParams::POLICY` in production |
/// | `device`   | positional | Raw partition, e.g. `/dev/sda2` |
/// | (key)      | `-` | Read from stdin |
#[derive(Debug, Clone)]
pub struct LuksFormatArgs {
    pub device: PathBuf,
    pub params: LuksParams,
}

impl LuksFormatArgs {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            params: LuksParams::POLICY,
        }
    }
}

impl ToolArgs for LuksFormatArgs {
    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["--batch-mode".to_string()];
        args.extend(self.params.to_cli_args());
        args.push("luksFormat".to_string());
        args.push(self.device.display().to_string());
        args.push(STDIN_KEY_FILE.to_string());
        args
    }

    fn tool_name(&self) -> &'static str {
        "cryptsetup"
    }

    /// LUKS format is DESTRUCTIVE - erases partition contents.
    fn is_destructive(&self) -> bool {
        true
    }
}

/// Arguments for `cryptsetup luksOpen`.
///
/// The decrypted device appears at `/dev/mapper/<mapper_name>`.
#[derive(Debug, Clone)]
pub struct LuksOpenArgs {
    pub device: PathBuf,
    pub mapper_name: String,
}

impl ToolArgs for LuksOpenArgs {
    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--batch-mode".to_string(),
            "luksOpen".to_string(),
            self.device.display().to_string(),
            self.mapper_name.clone(),
            STDIN_KEY_FILE.to_string(),
        ]
    }

    fn tool_name(&self) -> &'static str {
        "cryptsetup"
    }

    /// Does not touch on-disk data, but creates a kernel mapping, so dry-run
    /// skips it as well.
    fn is_destructive(&self) -> bool {
        true
    }
}

/// Arguments for `cryptsetup luksClose`.
#[derive(Debug, Clone)]
pub struct LuksCloseArgs {
    pub mapper_name: String,
}

impl ToolArgs for LuksCloseArgs {
    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--batch-mode".to_string(),
            "luksClose".to_string(),
            self.mapper_name.clone(),
        ]
    }

    fn tool_name(&self) -> &'static str {
        "cryptsetup"
    }

    /// Removes a kernel mapping; skipped in dry-run like open.
    fn is_destructive(&self) -> bool {
        true
    }
}
