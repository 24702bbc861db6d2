//! Block Device Model
//!
//! An arena of `BlockDevice` nodes built from the raw inventory. Children are
//! stored as ordered lists of `DeviceId` handles into the arena, so the tree
//! can be walked in both directions without shared mutable references.
//!
//! The model is plain data plus derived queries. The only field written after
//! construction by the storage core itself is the mapped name, and only the
//! encrypted volume mapper does that.

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::{Result, StorageError};
use crate::inventory::RawDevice;
use crate::types::BlockDeviceType;

/// Bundle that must be added to the install when any target is encrypted
pub const REQUIRED_BUNDLE: &str = "bootloader-extras";

/// Handle to a node in a `DeviceForest`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId(usize);

impl DeviceId {
    /// Position of the node in arena order (depth-first inventory order)
    pub fn index(self) -> usize {
        self.0
    }
}

/// A disk, partition or mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    /// Kernel name (`sda1`)
    pub name: String,
    pub kind: BlockDeviceType,
    pub model: Option<String>,
    /// Total size in bytes
    pub size: u64,
    pub removable: bool,
    pub read_only: bool,
    /// Filesystem signature found on the device, if any
    pub fs_type: Option<String>,
    /// Where the device is (or will be) mounted
    pub mount_point: Option<PathBuf>,
    mapped_name: Option<String>,
    parent: Option<DeviceId>,
    children: Vec<DeviceId>,
}

impl BlockDevice {
    fn from_raw(raw: &RawDevice, parent: Option<DeviceId>) -> Self {
        Self {
            name: raw.name.clone(),
            kind: BlockDeviceType::from_lsblk(&raw.kind),
            model: raw
                .model
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string),
            size: raw.size,
            removable: raw.removable,
            read_only: raw.read_only,
            fs_type: raw.fstype.clone().filter(|f| !f.is_empty()),
            mount_point: raw
                .mountpoint
                .as_deref()
                .filter(|m| !m.is_empty())
                .map(PathBuf::from),
            mapped_name: None,
            parent,
            children: Vec::new(),
        }
    }

    /// Canonical device path: `/dev/mapper/<mapped>` once a mapping is open,
    /// `/dev/<name>` otherwise.
    pub fn device_file(&self) -> PathBuf {
        match &self.mapped_name {
            Some(mapped) => Path::new("/dev/mapper").join(mapped),
            None => Path::new("/dev").join(&self.name),
        }
    }

    /// Name of the open dm-crypt mapping layered on this node
    pub fn mapped_name(&self) -> Option<&str> {
        self.mapped_name.as_deref()
    }

    pub fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    /// Children in inventory order
    pub fn children(&self) -> &[DeviceId] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// A partition with no filesystem, no mount and nothing layered on top:
    /// its space can be reused without destroying data.
    pub fn is_unused_partition(&self) -> bool {
        self.kind == BlockDeviceType::Part
            && self.fs_type.is_none()
            && self.mount_point.is_none()
            && self.children.is_empty()
    }

    /// Model string for display, falling back to the kernel name
    pub fn friendly_name(&self) -> &str {
        self.model.as_deref().unwrap_or(&self.name)
    }
}

/// The device tree of one machine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceForest {
    nodes: Vec<BlockDevice>,
    roots: Vec<DeviceId>,
}

impl DeviceForest {
    /// Build the forest from an inventory listing, preserving its order.
    pub fn from_inventory(devices: &[RawDevice]) -> Self {
        let mut forest = Self::default();
        for raw in devices {
            let id = forest.insert(raw, None);
            forest.roots.push(id);
        }
        forest
    }

    fn insert(&mut self, raw: &RawDevice, parent: Option<DeviceId>) -> DeviceId {
        let id = DeviceId(self.nodes.len());
        self.nodes.push(BlockDevice::from_raw(raw, parent));
        for child in &raw.children {
            let child_id = self.insert(child, Some(id));
            self.nodes[id.0].children.push(child_id);
        }
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Top-level devices in inventory order
    pub fn roots(&self) -> &[DeviceId] {
        &self.roots
    }

    pub fn get(&self, id: DeviceId) -> Option<&BlockDevice> {
        self.nodes.get(id.0)
    }

    /// Like `get`, but reports an unknown handle as an error
    pub fn device(&self, id: DeviceId) -> Result<&BlockDevice> {
        self.get(id)
            .ok_or_else(|| StorageError::UnknownDevice(format!("handle #{}", id.0)))
    }

    fn device_mut(&mut self, id: DeviceId) -> Result<&mut BlockDevice> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| StorageError::UnknownDevice(format!("handle #{}", id.0)))
    }

    /// Look a device up by kernel name (`sda2`), accepting a `/dev/` prefix
    pub fn find(&self, name: &str) -> Option<DeviceId> {
        let name = name.strip_prefix("/dev/").unwrap_or(name);
        self.nodes
            .iter()
            .position(|node| node.name == name)
            .map(DeviceId)
    }

    /// All nodes with their handles, depth-first in inventory order
    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &BlockDevice)> {
        self.nodes.iter().enumerate().map(|(i, node)| (DeviceId(i), node))
    }

    /// Every node below `id`, depth-first, excluding `id` itself
    pub fn descendants(&self, id: DeviceId) -> Vec<DeviceId> {
        let mut out = Vec::new();
        let mut stack: Vec<DeviceId> = match self.get(id) {
            Some(node) => node.children.iter().rev().copied().collect(),
            None => return out,
        };
        while let Some(next) = stack.pop() {
            out.push(next);
            if let Some(node) = self.get(next) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    /// Device path for `id`, see `BlockDevice::device_file`
    pub fn device_file(&self, id: DeviceId) -> Option<PathBuf> {
        self.get(id).map(BlockDevice::device_file)
    }

    /// True if the node is a crypt node, or anything anywhere beneath it is.
    pub fn encryption_enabled(&self, id: DeviceId) -> bool {
        match self.get(id) {
            Some(node) => {
                node.kind.is_crypt()
                    || node.children.iter().any(|&child| self.encryption_enabled(child))
            }
            None => false,
        }
    }

    /// True if any device in the forest uses encryption
    pub fn any_encryption_enabled(&self) -> bool {
        self.roots.iter().any(|&root| self.encryption_enabled(root))
    }

    /// Extra bundles the install needs for the current layout
    pub fn required_bundles(&self) -> Vec<&'static str> {
        if self.any_encryption_enabled() {
            vec![REQUIRED_BUNDLE]
        } else {
            Vec::new()
        }
    }

    /// Change a node's type; giving a partition the crypt type opts it into encryption.
    pub fn set_kind(&mut self, id: DeviceId, kind: BlockDeviceType) -> Result<()> {
        self.device_mut(id)?.kind = kind;
        Ok(())
    }

    /// Set or clear the intended mount point
    pub fn set_mount_point(&mut self, id: DeviceId, mount_point: Option<PathBuf>) -> Result<()> {
        self.device_mut(id)?.mount_point = mount_point;
        Ok(())
    }

    /// Opt a partition into encryption: give it the crypt type and the mount
    /// point its mapping will serve.
    ///
    /// Only unmounted partitions with nothing layered on them qualify. Whole
    /// disks, mounted partitions and existing mappings are refused, since
    /// formatting them would destroy data in use.
    pub fn mark_for_encryption(&mut self, id: DeviceId, mount_point: PathBuf) -> Result<()> {
        let node = self.device(id)?;
        if node.kind != BlockDeviceType::Part {
            return Err(StorageError::policy(format!(
                "cannot encrypt {}: device type is '{}', only partitions can be encrypted",
                node.name, node.kind
            )));
        }
        if let Some(mounted) = &node.mount_point {
            return Err(StorageError::policy(format!(
                "cannot encrypt {}: it is mounted at {}",
                node.name,
                mounted.display()
            )));
        }
        if !node.children.is_empty() {
            return Err(StorageError::policy(format!(
                "cannot encrypt {}: it is in use by {} other device(s)",
                node.name,
                node.children.len()
            )));
        }

        let node = self.device_mut(id)?;
        node.kind = BlockDeviceType::Crypt;
        node.mount_point = Some(mount_point);
        Ok(())
    }

    pub(crate) fn record_mapping(&mut self, id: DeviceId, mapped: &str) -> Result<()> {
        self.device_mut(id)?.mapped_name = Some(mapped.to_string());
        Ok(())
    }

    pub(crate) fn clear_mapping(&mut self, id: DeviceId) -> Result<Option<String>> {
        Ok(self.device_mut(id)?.mapped_name.take())
    }
}
