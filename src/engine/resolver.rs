//! Install Target Resolver
//!
//! Decides which disks can host an installation and at what cost.
//!
//! # Classification
//!
//! | Disk state                                    | Result |
//! |-----------------------------------------------|--------|
//! | largest reusable region >= minimum            | safe target (`whole_disk = false`) |
//! | no such region, total size >= minimum         | destructive target (`whole_disk = true`) |
//! | total size < minimum                          | omitted |
//!
//! A reusable region is either the space not covered by any partition, or a
//! single partition with no filesystem, no mount and nothing layered on it.
//! A disk with no partition table at all has no reusable region: installing
//! onto it means writing a new table, which is a wipe.
//!
//! Only top-level, writable `disk` devices are candidates. Output order follows
//! the inventory order; nothing is re-sorted by size.
//!
//! Resolution never fails. An empty result means "no usable media".

use serde::Serialize;
use tracing::{debug, info};

use crate::engine::device::{BlockDevice, DeviceForest, DeviceId};
use crate::types::TargetKind;

/// A place the installer can put the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallTarget {
    /// Underlying device name (`sda`)
    pub name: String,
    /// Human-readable label for display
    pub friendly: String,
    /// True if choosing this target wipes the whole disk
    pub whole_disk: bool,
    pub removable: bool,
    /// Bytes available to the install: the reusable region for safe targets,
    /// the whole disk for destructive ones.
    pub capacity: u64,
}

impl InstallTarget {
    pub fn kind(&self) -> TargetKind {
        TargetKind::from_whole_disk(self.whole_disk)
    }

    /// `/dev/<name>` of the underlying disk
    pub fn device_file(&self) -> String {
        format!("/dev/{}", self.name)
    }
}

/// Free space on `disk` not covered by any child partition
pub fn unallocated_space(forest: &DeviceForest, disk: &BlockDevice) -> u64 {
    let used: u64 = disk
        .children()
        .iter()
        .filter_map(|&child| forest.get(child))
        .map(|child| child.size)
        .fold(0u64, u64::saturating_add);
    disk.size.saturating_sub(used)
}

/// Size of the largest region on `id` that can be reused without touching
/// existing data. Zero for disks without a partition table.
pub fn reusable_space(forest: &DeviceForest, id: DeviceId) -> u64 {
    let Some(disk) = forest.get(id) else {
        return 0;
    };
    if disk.is_leaf() {
        return 0;
    }

    let largest_unused = disk
        .children()
        .iter()
        .filter_map(|&child| forest.get(child))
        .filter(|child| child.is_unused_partition())
        .map(|child| child.size)
        .max()
        .unwrap_or(0);

    unallocated_space(forest, disk).max(largest_unused)
}

/// Classify a single device. `None` if it cannot host an install.
pub fn classify(forest: &DeviceForest, id: DeviceId, min_size: u64) -> Option<InstallTarget> {
    let disk = forest.get(id)?;

    if !disk.kind.is_installable_disk() {
        debug!("Skipping {} ({}): not a disk", disk.name, disk.kind);
        return None;
    }
    if disk.read_only {
        debug!("Skipping {}: read-only", disk.name);
        return None;
    }

    let reusable = reusable_space(forest, id);
    let (whole_disk, capacity) = if reusable >= min_size {
        (false, reusable)
    } else if disk.size >= min_size {
        (true, disk.size)
    } else {
        debug!(
            "Skipping {}: {} is below the minimum of {}",
            disk.name,
            format_size(disk.size),
            format_size(min_size)
        );
        return None;
    };

    let target = InstallTarget {
        name: disk.name.clone(),
        friendly: disk.friendly_name().to_string(),
        whole_disk,
        removable: disk.removable,
        capacity,
    };
    debug!(
        "{} classified as {} ({} usable)",
        target.name,
        target.kind(),
        format_size(capacity)
    );
    Some(target)
}

/// Resolve every top-level disk into at most one install target.
pub fn find_install_targets(min_size: u64, forest: &DeviceForest) -> Vec<InstallTarget> {
    let targets: Vec<InstallTarget> = forest
        .roots()
        .iter()
        .filter_map(|&root| classify(forest, root, min_size))
        .collect();

    info!(
        "Resolved {} install target(s) from {} disk(s) with minimum size {}",
        targets.len(),
        forest.roots().len(),
        format_size(min_size)
    );
    targets
}

/// Targets split by kind, each list in inventory order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetListing {
    pub safe: Vec<InstallTarget>,
    pub destructive: Vec<InstallTarget>,
}

impl TargetListing {
    pub fn resolve(min_size: u64, forest: &DeviceForest) -> Self {
        Self::from_targets(find_install_targets(min_size, forest))
    }

    pub fn from_targets(targets: Vec<InstallTarget>) -> Self {
        let (destructive, safe) = targets.into_iter().partition(|t| t.whole_disk);
        Self { safe, destructive }
    }

    pub fn is_empty(&self) -> bool {
        self.safe.is_empty() && self.destructive.is_empty()
    }

    pub fn len(&self) -> usize {
        self.safe.len() + self.destructive.len()
    }

    /// Find a target by device name in either list
    pub fn find(&self, name: &str) -> Option<&InstallTarget> {
        let name = name.strip_prefix("/dev/").unwrap_or(name);
        self.safe
            .iter()
            .chain(self.destructive.iter())
            .find(|t| t.name == name)
    }
}

/// One-line description of what choosing `target` will do
pub fn selection_summary(target: Option<&InstallTarget>) -> String {
    match target {
        None => "No usable media found".to_string(),
        Some(t) if t.whole_disk => format!("WARNING: Wiping {}", t.device_file()),
        Some(t) => format!("Installing into free space on {}", t.device_file()),
    }
}

/// Convert bytes to a human-readable size string.
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;

    if bytes >= TIB {
        format!("{:.2} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}
