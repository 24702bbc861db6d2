//! Encrypted Volume Mapper
//!
//! Drives each encrypted partition through
//! `Unmapped -> Formatted -> Opened -> Closed` with `cryptsetup`.
//!
//! # Rules
//!
//! - Only nodes of type `crypt` may be formatted or opened. Anything else is
//!   rejected before a tool runs.
//! - Open requires a prior successful format and an intended mount point.
//!   The mapping name is derived from the mount point (`mapping_name`).
//! - The passphrase reaches cryptsetup over stdin only.
//! - A failed tool call leaves the device in its previous state and returns
//!   the tool output in `StorageError::Tool`.
//! - Every successful open is recorded in the `MountedEncrypts` registry and
//!   on the device node. `close_all` closes everything in the registry and
//!   keeps going past individual failures.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use strum::Display;
use tracing::{debug, error, info, warn};

use crate::command_runner::CommandRunner;
use crate::crypt::args::{LuksCloseArgs, LuksFormatArgs, LuksOpenArgs};
use crate::crypt::registry::MountedEncrypts;
use crate::engine::device::{DeviceForest, DeviceId};
use crate::error::{Result, StorageError};
use crate::passphrase::Passphrase;
use crate::process_guard::{CleanupHandle, register_cleanup};
use crate::tool_args::ToolArgs;

/// Mapping name reserved for the root filesystem
pub const ROOT_MAPPING_NAME: &str = "root";

/// Derive the dm-crypt mapping name for a mount point.
///
/// `/` maps to `root`. Anything else is lower-cased, loses one leading `/`,
/// and has the remaining separators replaced with `_`: `/var/log` becomes
/// `var_log`.
pub fn mapping_name(mount_point: &str) -> String {
    if mount_point == "/" {
        return ROOT_MAPPING_NAME.to_string();
    }
    let lowered = mount_point.to_lowercase();
    lowered
        .strip_prefix('/')
        .unwrap_or(&lowered)
        .replace('/', "_")
}

/// Lifecycle of one encrypted partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum MappingState {
    #[default]
    Unmapped,
    Formatted,
    Opened,
    Closed,
}

/// Outcome of closing every registered mapping
#[derive(Debug, Default)]
pub struct CloseReport {
    pub closed: Vec<String>,
    pub failed: Vec<(String, StorageError)>,
}

impl CloseReport {
    /// True if every close succeeded
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of mappings handled, successful or not
    pub fn total(&self) -> usize {
        self.closed.len() + self.failed.len()
    }
}

fn close_mapping<R: CommandRunner + ?Sized>(runner: &R, binary: &Path, name: &str) -> Result<()> {
    let command = LuksCloseArgs {
        mapper_name: name.to_string(),
    }
    .to_command(binary);
    info!("Closing encrypted mapping '{}'", name);
    runner.run(&command)?.ensure_success(&command.operation())?;
    Ok(())
}

/// Close every mapping in `registry`, newest first.
///
/// Each entry is removed from the registry whether or not its close
/// succeeded; failures are logged and returned in the report.
pub fn close_registered<R: CommandRunner + ?Sized>(
    runner: &R,
    binary: &Path,
    registry: &MountedEncrypts,
) -> CloseReport {
    let mut report = CloseReport::default();
    for name in registry.names().into_iter().rev() {
        match close_mapping(runner, binary, &name) {
            Ok(()) => report.closed.push(name.clone()),
            Err(e) => {
                error!("Failed to close encrypted mapping '{}': {}", name, e);
                report.failed.push((name.clone(), e));
            }
        }
        registry.remove(&name);
    }
    if report.total() > 0 {
        info!(
            "Closed {} encrypted mapping(s), {} failure(s)",
            report.closed.len(),
            report.failed.len()
        );
    }
    report
}

/// Formats, opens and closes LUKS volumes on crypt nodes of a `DeviceForest`.
#[derive(Debug)]
pub struct EncryptedVolumeMapper<R> {
    runner: R,
    binary: PathBuf,
    registry: MountedEncrypts,
    states: HashMap<DeviceId, MappingState>,
    opened: HashMap<String, DeviceId>,
}

impl<R: CommandRunner> EncryptedVolumeMapper<R> {
    pub fn new(runner: R, registry: MountedEncrypts) -> Self {
        Self::with_binary(runner, registry, PathBuf::from("cryptsetup"))
    }

    /// Use a specific cryptsetup binary
    pub fn with_binary(runner: R, registry: MountedEncrypts, binary: PathBuf) -> Self {
        Self {
            runner,
            binary,
            registry,
            states: HashMap::new(),
            opened: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &MountedEncrypts {
        &self.registry
    }

    /// Current lifecycle state of `id`.
    ///
    /// A mapping closed behind the mapper's back (by the signal cleanup hook,
    /// or by anyone else sharing the registry) reads as `Closed`.
    pub fn state_of(&self, id: DeviceId) -> MappingState {
        match self.states.get(&id).copied().unwrap_or_default() {
            MappingState::Opened if !self.is_registered(id) => MappingState::Closed,
            state => state,
        }
    }

    fn is_registered(&self, id: DeviceId) -> bool {
        self.opened
            .iter()
            .any(|(name, &device)| device == id && self.registry.contains(name))
    }

    /// Drop bookkeeping for mappings that are no longer in the registry and
    /// point their devices back at the raw partition. Returns the names
    /// that were dropped.
    pub fn reconcile(&mut self, forest: &mut DeviceForest) -> Vec<String> {
        let stale: Vec<String> = self
            .opened
            .keys()
            .filter(|name| !self.registry.contains(name))
            .cloned()
            .collect();
        for name in &stale {
            debug!("Mapping '{}' was closed elsewhere", name);
            self.forget(forest, name);
        }
        stale
    }

    fn require_crypt(forest: &DeviceForest, id: DeviceId, action: &str) -> Result<()> {
        let node = forest.device(id)?;
        if !node.kind.is_crypt() {
            return Err(StorageError::policy(format!(
                "cannot {} {}: device type is '{}', not 'crypt'",
                action, node.name, node.kind
            )));
        }
        Ok(())
    }

    /// Write a LUKS header to the device.
    pub fn format(&mut self, forest: &DeviceForest, id: DeviceId, passphrase: &Passphrase) -> Result<()> {
        Self::require_crypt(forest, id, "format")?;
        let node = forest.device(id)?;
        if self.state_of(id) == MappingState::Opened {
            return Err(StorageError::policy(format!(
                "cannot format {}: it is open, close it first",
                node.name
            )));
        }

        let command = LuksFormatArgs::new(node.device_file()).to_command(&self.binary);
        info!("Formatting {} with LUKS", node.device_file().display());
        debug!("Passphrase length: {}", passphrase.len());

        self.runner
            .run_with_stdin(passphrase.expose().as_bytes(), &command)?
            .ensure_success(&command.operation())?;

        self.states.insert(id, MappingState::Formatted);
        Ok(())
    }

    /// Unlock a formatted device. Returns the mapped device file
    /// (`/dev/mapper/<name>`).
    pub fn open(&mut self, forest: &mut DeviceForest, id: DeviceId, passphrase: &Passphrase) -> Result<PathBuf> {
        Self::require_crypt(forest, id, "open")?;
        self.reconcile(forest);
        let node = forest.device(id)?;

        let state = self.state_of(id);
        if !matches!(state, MappingState::Formatted | MappingState::Closed) {
            return Err(StorageError::policy(format!(
                "cannot open {}: it must be formatted first (state: {})",
                node.name, state
            )));
        }

        let mount_point = node.mount_point.as_ref().ok_or_else(|| {
            StorageError::policy(format!("cannot open {}: no mount point assigned", node.name))
        })?;
        let name = mapping_name(&mount_point.to_string_lossy());
        if self.registry.contains(&name) {
            return Err(StorageError::policy(format!(
                "cannot open {}: mapping name '{}' is already in use",
                node.name, name
            )));
        }

        let command = LuksOpenArgs {
            device: node.device_file(),
            mapper_name: name.clone(),
        }
        .to_command(&self.binary);

        self.runner
            .run_with_stdin(passphrase.expose().as_bytes(), &command)?
            .ensure_success(&command.operation())?;

        self.registry.record(&name)?;
        forest.record_mapping(id, &name)?;
        self.states.insert(id, MappingState::Opened);
        self.opened.insert(name.clone(), id);

        let mapped = forest.device(id)?.device_file();
        info!("Disk partition {} is mapped to {}", forest.device(id)?.name, mapped.display());
        Ok(mapped)
    }

    /// Format then open, strictly in that order.
    pub fn map_encrypted(
        &mut self,
        forest: &mut DeviceForest,
        id: DeviceId,
        passphrase: &Passphrase,
    ) -> Result<PathBuf> {
        self.format(forest, id, passphrase)?;
        self.open(forest, id, passphrase)
    }

    /// Close one open mapping by name.
    ///
    /// The registry entry is removed only if the close succeeds, so a failed
    /// close can be retried (or is picked up by `close_all`).
    pub fn close(&mut self, forest: &mut DeviceForest, name: &str) -> Result<()> {
        self.reconcile(forest);
        if !self.registry.contains(name) {
            return Err(StorageError::policy(format!("mapping '{}' is not open", name)));
        }
        close_mapping(&self.runner, &self.binary, name)?;
        self.registry.remove(name);
        self.forget(forest, name);
        Ok(())
    }

    /// Close the mapping layered on `id`
    pub fn close_device(&mut self, forest: &mut DeviceForest, id: DeviceId) -> Result<()> {
        self.reconcile(forest);
        let node = forest.device(id)?;
        let name = node
            .mapped_name()
            .map(str::to_string)
            .ok_or_else(|| StorageError::policy(format!("{} has no open mapping", node.name)))?;
        self.close(forest, &name)
    }

    /// Close every registered mapping, tolerating individual failures.
    pub fn close_all(&mut self, forest: &mut DeviceForest) -> CloseReport {
        self.reconcile(forest);
        let report = close_registered(&self.runner, &self.binary, &self.registry);
        for name in report
            .closed
            .iter()
            .chain(report.failed.iter().map(|(name, _)| name))
        {
            self.forget(forest, name);
        }
        report
    }

    fn forget(&mut self, forest: &mut DeviceForest, name: &str) {
        if let Some(id) = self.opened.remove(name) {
            if let Err(e) = forest.clear_mapping(id) {
                warn!("Could not clear mapping '{}' from device tree: {}", name, e);
            }
            self.states.insert(id, MappingState::Closed);
        }
    }
}

impl<R: CommandRunner> EncryptedVolumeMapper<R> {
    /// Guard that closes every registered mapping when dropped.
    ///
    /// The guard holds the mapper and the forest for its lifetime, so the
    /// close it performs on drop also updates states and device files.
    pub fn cleanup_on_drop<'a>(&'a mut self, forest: &'a mut DeviceForest) -> MappingCleanup<'a, R> {
        MappingCleanup {
            mapper: self,
            forest,
            armed: true,
        }
    }
}

impl<R: CommandRunner + Clone + 'static> EncryptedVolumeMapper<R> {
    /// Register a signal cleanup hook that closes every registered mapping.
    ///
    /// The hook only sees the registry; the mapper catches up on its next
    /// call (see `reconcile`). The hook is removed when the returned handle
    /// is dropped.
    pub fn cleanup_hook(&self) -> CleanupHandle {
        let runner = self.runner.clone();
        let binary = self.binary.clone();
        let registry = self.registry.clone();
        register_cleanup("close encrypted mappings", move || {
            close_registered(&runner, &binary, &registry);
        })
    }
}

/// Closes all registered mappings on drop unless `keep_open` is called.
#[must_use = "mappings are closed as soon as the guard is dropped"]
pub struct MappingCleanup<'a, R: CommandRunner> {
    mapper: &'a mut EncryptedVolumeMapper<R>,
    forest: &'a mut DeviceForest,
    armed: bool,
}

impl<R: CommandRunner> MappingCleanup<'_, R> {
    /// Format then open `id`, see `EncryptedVolumeMapper::map_encrypted`
    pub fn map_encrypted(&mut self, id: DeviceId, passphrase: &Passphrase) -> Result<PathBuf> {
        self.mapper.map_encrypted(self.forest, id, passphrase)
    }

    pub fn mapper(&self) -> &EncryptedVolumeMapper<R> {
        &*self.mapper
    }

    pub fn forest(&self) -> &DeviceForest {
        &*self.forest
    }

    /// Close everything now and report the outcome
    pub fn close_all(mut self) -> CloseReport {
        self.armed = false;
        self.mapper.close_all(self.forest)
    }

    /// Leave the mappings open when the guard goes away
    pub fn keep_open(mut self) {
        self.armed = false;
    }
}

impl<R: CommandRunner> Drop for MappingCleanup<'_, R> {
    fn drop(&mut self) {
        if self.armed && !self.mapper.registry.is_empty() {
            let report = self.mapper.close_all(self.forest);
            debug!("Cleanup guard closed {} mapping(s)", report.total());
        }
    }
}
