//! installer-storage library
//!
//! Storage decisions for an OS installer: which disks can host the install,
//! and the LUKS lifecycle of partitions the user chose to encrypt.

pub mod cli;
pub mod command_runner;
pub mod config_file;
pub mod crypt;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod passphrase;
pub mod process_guard;
pub mod sanity;
pub mod tool_args;
pub mod types;

// Re-export main types for convenience
pub use command_runner::{CommandOutput, CommandRunner, SystemRunner};
pub use config_file::StorageConfig;
pub use error::{Result, StorageError};
pub use process_guard::{ChildRegistry, CleanupHandle, CommandProcessGroup};
pub use tool_args::{ToolArgs, ToolCommand};
pub use types::{BlockDeviceType, TargetKind};

// Device model and resolver
pub use engine::device::{BlockDevice, DeviceForest, DeviceId, REQUIRED_BUNDLE};
pub use engine::resolver::{InstallTarget, TargetListing, find_install_targets, selection_summary};

// Inventory sources
pub use inventory::{DeviceInventory, JsonFileInventory, LsblkInventory, RawDevice};

// Encryption
pub use crypt::args::{LuksCloseArgs, LuksFormatArgs, LuksOpenArgs, LuksParams};
pub use crypt::{CloseReport, EncryptedVolumeMapper, MappingCleanup, MappingState, MountedEncrypts, mapping_name};
pub use passphrase::{
    Passphrase, PassphrasePolicy, PassphrasePrompt, PassphraseRejection, SecretSource,
    is_valid_passphrase,
};
