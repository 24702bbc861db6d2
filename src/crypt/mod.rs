//! LUKS encryption of install targets.
//!
//! - `args`: typed `cryptsetup` command lines with the fixed LUKS policy
//! - `registry`: the set of currently-open mappings
//! - `mapper`: the per-device format/open/close state machine

pub mod args;
pub mod mapper;
pub mod registry;

pub use mapper::{CloseReport, EncryptedVolumeMapper, MappingCleanup, MappingState, mapping_name};
pub use registry::MountedEncrypts;
