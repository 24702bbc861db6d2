//! Type-safe device and target classification types
//!
//! Kernel device types arrive from the inventory as free-form strings
//! (`disk`, `part`, `crypt`, ...). They are parsed once into enums so the
//! rest of the crate can match exhaustively.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Kernel block device type, as reported by `lsblk -o TYPE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BlockDeviceType {
    /// Whole physical (or virtual) disk
    Disk,
    /// Partition of a disk
    #[strum(to_string = "part", serialize = "partition")]
    #[serde(rename = "part")]
    Part,
    /// dm-crypt (LUKS) mapping, or a partition the user chose to encrypt
    Crypt,
    /// Loop device
    Loop,
    /// Optical drive
    Rom,
    /// LVM logical volume
    Lvm,
    /// Software RAID (md) device
    Raid,
    #[default]
    Unknown,
}

impl BlockDeviceType {
    /// Parse an lsblk TYPE column. Unrecognised values become `Unknown`.
    pub fn from_lsblk(kind: &str) -> Self {
        let kind = kind.trim().to_ascii_lowercase();
        if kind.starts_with("raid") || kind == "md" {
            return Self::Raid;
        }
        kind.parse().unwrap_or(Self::Unknown)
    }

    /// Returns true for dm-crypt nodes
    pub fn is_crypt(self) -> bool {
        matches!(self, Self::Crypt)
    }

    /// Returns true for device types that can be handed to the resolver as a
    /// whole install disk.
    pub fn is_installable_disk(self) -> bool {
        matches!(self, Self::Disk)
    }
}

/// Classification of an install target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TargetKind {
    /// Free space inside an existing layout; no data is touched
    Safe,
    /// The whole disk is wiped
    Destructive,
}

impl TargetKind {
    /// Derive the kind from the `WholeDisk` flag of a target
    pub fn from_whole_disk(whole_disk: bool) -> Self {
        if whole_disk {
            Self::Destructive
        } else {
            Self::Safe
        }
    }
}
