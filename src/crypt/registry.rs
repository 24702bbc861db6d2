//! Mounted-Encrypt Registry
//!
//! The list of dm-crypt mappings this process has opened and not yet closed.
//! It is an explicit context object rather than a global: the mapper owns a
//! handle, cleanup paths get a clone, and every clone sees the same list.
//! All access goes through a mutex, so mappings may be opened from more than
//! one thread.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::error::{Result, StorageError};

/// Shared handle to the set of open mapping names
#[derive(Debug, Clone, Default)]
pub struct MountedEncrypts {
    names: Arc<Mutex<Vec<String>>>,
}

impl MountedEncrypts {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<String>> {
        // A panic while holding the lock cannot leave the Vec half-updated.
        self.names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a newly opened mapping. A name may only be present once.
    pub fn record(&self, name: &str) -> Result<()> {
        let mut entries = self.entries();
        if entries.iter().any(|n| n == name) {
            return Err(StorageError::policy(format!(
                "mapping '{}' is already open",
                name
            )));
        }
        entries.push(name.to_string());
        debug!("Registry: recorded '{}' ({} open)", name, entries.len());
        Ok(())
    }

    /// Remove a mapping. Returns false if it was not recorded.
    pub fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|n| n != name);
        let removed = entries.len() != before;
        if removed {
            debug!("Registry: removed '{}' ({} open)", name, entries.len());
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries().iter().any(|n| n == name)
    }

    /// Snapshot of the open mapping names, oldest first
    pub fn names(&self) -> Vec<String> {
        self.entries().clone()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// True if both handles refer to the same registry
    pub fn same_registry(&self, other: &MountedEncrypts) -> bool {
        Arc::ptr_eq(&self.names, &other.names)
    }
}
