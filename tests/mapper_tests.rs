//! Tests for the Encrypted Volume Mapper
//!
//! A recording `CommandRunner` stands in for cryptsetup. These tests verify:
//! - format/open/close build the expected command lines
//! - the passphrase only ever travels over stdin
//! - policy violations are rejected before any tool runs
//! - tool failures leave the device in its previous state
//! - registry entries are added once and removed once
//! - `close_all` keeps going past individual failures

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use installer_storage::command_runner::{CommandOutput, CommandRunner, SystemRunner};
use installer_storage::crypt::{EncryptedVolumeMapper, MappingState, MountedEncrypts};
use installer_storage::engine::device::{DeviceForest, DeviceId};
use installer_storage::inventory::RawDevice;
use installer_storage::passphrase::{Passphrase, PassphrasePolicy};
use installer_storage::process_guard::{cleanup_hook_count, run_cleanup_hooks};
use installer_storage::tool_args::ToolCommand;
use installer_storage::{Result, StorageError};

const SECRET: &str = "correct horse battery";

// =============================================================================
// Test doubles
// =============================================================================

#[derive(Debug, Clone)]
struct Call {
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
}

impl Call {
    fn line(&self) -> String {
        self.args.join(" ")
    }
}

/// Records every command; fails those whose argument line contains a
/// registered needle.
#[derive(Default)]
struct RecordingRunner {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<Vec<(String, CommandOutput)>>,
}

impl RecordingRunner {
    fn fail_when(&self, needle: &str, output: CommandOutput) {
        self.failures
            .lock()
            .unwrap()
            .push((needle.to_string(), output));
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn respond(&self, command: &ToolCommand, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let call = Call {
            args: command.args.clone(),
            stdin: stdin.map(<[u8]>::to_vec),
        };
        let line = call.line();
        self.calls.lock().unwrap().push(call);

        let failures = self.failures.lock().unwrap();
        Ok(failures
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput::ok("")))
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, command: &ToolCommand) -> Result<CommandOutput> {
        self.respond(command, None)
    }

    fn run_with_stdin(&self, secret: &[u8], command: &ToolCommand) -> Result<CommandOutput> {
        self.respond(command, Some(secret))
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn passphrase() -> Passphrase {
    PassphrasePolicy::default().accept(SECRET).unwrap()
}

/// sda with three partitions; sda2 and sda3 are opted into encryption
fn layout() -> DeviceForest {
    let part = |name: &str| RawDevice {
        name: name.to_string(),
        size: 10_000_000_000,
        kind: "part".to_string(),
        ..Default::default()
    };
    let mut forest = DeviceForest::from_inventory(&[RawDevice {
        name: "sda".to_string(),
        size: 40_000_000_000,
        kind: "disk".to_string(),
        children: vec![part("sda1"), part("sda2"), part("sda3"), part("sda4")],
        ..Default::default()
    }]);

    for (name, mount_point) in [("sda2", "/"), ("sda3", "/var/log"), ("sda4", "/home")] {
        let id = forest.find(name).unwrap();
        forest.mark_for_encryption(id, PathBuf::from(mount_point)).unwrap();
    }
    let sda1 = forest.find("sda1").unwrap();
    forest.set_mount_point(sda1, Some(PathBuf::from("/boot"))).unwrap();
    forest
}

fn mapper() -> (Arc<RecordingRunner>, EncryptedVolumeMapper<Arc<RecordingRunner>>) {
    let runner = Arc::new(RecordingRunner::default());
    let mapper = EncryptedVolumeMapper::new(runner.clone(), MountedEncrypts::new());
    (runner, mapper)
}

fn id(forest: &DeviceForest, name: &str) -> DeviceId {
    forest.find(name).unwrap()
}

// =============================================================================
// Happy path
// =============================================================================

#[test]
fn test_map_encrypted_formats_then_opens() {
    let (runner, mut mapper) = mapper();
    let mut forest = layout();
    let sda2 = id(&forest, "sda2");

    let mapped = mapper.map_encrypted(&mut forest, sda2, &passphrase()).unwrap();

    assert_eq!(mapped, PathBuf::from("/dev/mapper/root"));
    assert_eq!(forest.device_file(sda2), Some(PathBuf::from("/dev/mapper/root")));
    assert_eq!(mapper.state_of(sda2), MappingState::Opened);
    assert_eq!(mapper.registry().names(), vec!["root"]);

    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[0].line(),
        "--batch-mode --hash=sha256 --cipher=aes-xts-plain64 --key-size=512 luksFormat /dev/sda2 -"
    );
    assert_eq!(calls[1].line(), "--batch-mode luksOpen /dev/sda2 root -");
}

#[test]
fn test_passphrase_only_on_stdin() {
    let (runner, mut mapper) = mapper();
    let mut forest = layout();
    let sda3 = id(&forest, "sda3");

    mapper.map_encrypted(&mut forest, sda3, &passphrase()).unwrap();

    for call in runner.calls() {
        assert!(call.args.iter().all(|a| !a.contains(SECRET)));
        assert_eq!(call.stdin.as_deref(), Some(SECRET.as_bytes()));
    }
}

#[test]
fn test_nested_mount_point_mapping_name() {
    let (_runner, mut mapper) = mapper();
    let mut forest = layout();
    let sda3 = id(&forest, "sda3");

    let mapped = mapper.map_encrypted(&mut forest, sda3, &passphrase()).unwrap();
    assert_eq!(mapped, PathBuf::from("/dev/mapper/var_log"));
    assert_eq!(forest.get(sda3).and_then(|d| d.mapped_name()), Some("var_log"));
}

// =============================================================================
// Policy violations
// =============================================================================

#[test]
fn test_format_non_crypt_node_fails_fast() {
    let (runner, mut mapper) = mapper();
    let mut forest = layout();
    let sda1 = id(&forest, "sda1");

    let err = mapper.map_encrypted(&mut forest, sda1, &passphrase()).unwrap_err();
    assert!(err.is_policy());
    assert!(err.to_string().contains("sda1"));
    assert!(runner.calls().is_empty());
    assert_eq!(mapper.state_of(sda1), MappingState::Unmapped);
}

#[test]
fn test_open_before_format_rejected() {
    let (runner, mut mapper) = mapper();
    let mut forest = layout();
    let sda2 = id(&forest, "sda2");

    let err = mapper.open(&mut forest, sda2, &passphrase()).unwrap_err();
    assert!(err.is_policy());
    assert!(runner.calls().is_empty());
}

#[test]
fn test_open_without_mount_point_rejected() {
    let (runner, mut mapper) = mapper();
    let mut forest = layout();
    let sda2 = id(&forest, "sda2");
    forest.set_mount_point(sda2, None).unwrap();

    mapper.format(&forest, sda2, &passphrase()).unwrap();
    let err = mapper.open(&mut forest, sda2, &passphrase()).unwrap_err();
    assert!(err.is_policy());
    assert_eq!(runner.calls().len(), 1, "only the format ran");
    assert_eq!(mapper.state_of(sda2), MappingState::Formatted);
}

#[test]
fn test_duplicate_mapping_name_rejected() {
    let (runner, mut mapper) = mapper();
    let mut forest = layout();
    let sda3 = id(&forest, "sda3");
    let sda4 = id(&forest, "sda4");
    forest.set_mount_point(sda4, Some(PathBuf::from("/VAR/LOG"))).unwrap();

    mapper.map_encrypted(&mut forest, sda3, &passphrase()).unwrap();
    let err = mapper.map_encrypted(&mut forest, sda4, &passphrase()).unwrap_err();

    assert!(err.is_policy());
    assert_eq!(mapper.registry().names(), vec!["var_log"]);
    // sda4 was formatted but never opened
    assert!(!runner.calls().iter().any(|c| c.line().contains("luksOpen /dev/sda4")));
}

#[test]
fn test_format_while_open_rejected() {
    let (_runner, mut mapper) = mapper();
    let mut forest = layout();
    let sda2 = id(&forest, "sda2");

    mapper.map_encrypted(&mut forest, sda2, &passphrase()).unwrap();
    assert!(mapper.format(&forest, sda2, &passphrase()).unwrap_err().is_policy());
}

// =============================================================================
// Tool failures
// =============================================================================

#[test]
fn test_format_failure_surfaces_output_and_keeps_state() {
    let (runner, mut mapper) = mapper();
    runner.fail_when(
        "luksFormat",
        CommandOutput::failed(1, "Device /dev/sda2 is in use."),
    );
    let mut forest = layout();
    let sda2 = id(&forest, "sda2");

    let err = mapper.map_encrypted(&mut forest, sda2, &passphrase()).unwrap_err();
    match &err {
        StorageError::Tool { exit_code, output, .. } => {
            assert_eq!(*exit_code, Some(1));
            assert!(output.contains("is in use"));
        }
        other => panic!("expected tool error, got {other:?}"),
    }
    assert_eq!(mapper.state_of(sda2), MappingState::Unmapped);
    assert!(mapper.registry().is_empty());
    assert_eq!(runner.calls().len(), 1, "open must not follow a failed format");
}

#[test]
fn test_open_failure_keeps_formatted_state() {
    let (runner, mut mapper) = mapper();
    runner.fail_when("luksOpen", CommandOutput::failed(2, "No key available with this passphrase."));
    let mut forest = layout();
    let sda2 = id(&forest, "sda2");

    let err = mapper.map_encrypted(&mut forest, sda2, &passphrase()).unwrap_err();
    assert!(matches!(err, StorageError::Tool { exit_code: Some(2), .. }));
    assert_eq!(mapper.state_of(sda2), MappingState::Formatted);
    assert!(mapper.registry().is_empty());
    assert_eq!(forest.device_file(sda2), Some(PathBuf::from("/dev/sda2")));
}

// =============================================================================
// Closing
// =============================================================================

fn open_all(
    mapper: &mut EncryptedVolumeMapper<Arc<RecordingRunner>>,
    forest: &mut DeviceForest,
) -> Vec<DeviceId> {
    ["sda2", "sda3", "sda4"]
        .into_iter()
        .map(|name| {
            let device = id(forest, name);
            mapper.map_encrypted(forest, device, &passphrase()).unwrap();
            device
        })
        .collect()
}

#[test]
fn test_close_removes_entry_once() {
    let (runner, mut mapper) = mapper();
    let mut forest = layout();
    let ids = open_all(&mut mapper, &mut forest);

    mapper.close(&mut forest, "home").unwrap();

    assert_eq!(mapper.registry().names(), vec!["root", "var_log"]);
    assert_eq!(mapper.state_of(ids[2]), MappingState::Closed);
    assert_eq!(forest.device_file(ids[2]), Some(PathBuf::from("/dev/sda4")));
    assert_eq!(
        runner.calls().last().map(Call::line).as_deref(),
        Some("--batch-mode luksClose home")
    );

    // A second close is a policy error, not a second tool call
    let calls_before = runner.calls().len();
    assert!(mapper.close(&mut forest, "home").unwrap_err().is_policy());
    assert_eq!(runner.calls().len(), calls_before);
}

#[test]
fn test_failed_close_keeps_entry_for_retry() {
    let (runner, mut mapper) = mapper();
    runner.fail_when("luksClose root", CommandOutput::failed(5, "Device root is still in use."));
    let mut forest = layout();
    let ids = open_all(&mut mapper, &mut forest);

    let err = mapper.close_device(&mut forest, ids[0]).unwrap_err();
    assert!(matches!(err, StorageError::Tool { .. }));
    assert!(mapper.registry().contains("root"));
    assert_eq!(mapper.state_of(ids[0]), MappingState::Opened);
}

#[test]
fn test_close_all_tolerates_failures() {
    let (runner, mut mapper) = mapper();
    runner.fail_when("luksClose var_log", CommandOutput::failed(5, "busy"));
    let mut forest = layout();
    let ids = open_all(&mut mapper, &mut forest);

    let report = mapper.close_all(&mut forest);

    assert_eq!(report.closed.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "var_log");
    assert!(!report.is_clean());
    assert!(mapper.registry().is_empty());
    for device in ids {
        assert_eq!(mapper.state_of(device), MappingState::Closed);
        assert!(forest.get(device).and_then(|d| d.mapped_name()).is_none());
    }

    let close_calls = runner
        .calls()
        .iter()
        .filter(|c| c.line().contains("luksClose"))
        .count();
    assert_eq!(close_calls, 3, "every mapping gets a close attempt");
}

#[test]
fn test_reopen_after_close() {
    let (_runner, mut mapper) = mapper();
    let mut forest = layout();
    let sda2 = id(&forest, "sda2");

    mapper.map_encrypted(&mut forest, sda2, &passphrase()).unwrap();
    mapper.close(&mut forest, "root").unwrap();
    let mapped = mapper.open(&mut forest, sda2, &passphrase()).unwrap();

    assert_eq!(mapped, PathBuf::from("/dev/mapper/root"));
    assert_eq!(mapper.registry().names(), vec!["root"]);
}

#[test]
fn test_cleanup_guard_closes_on_drop() {
    let (runner, mut mapper) = mapper();
    let mut forest = layout();
    {
        let mut cleanup = mapper.cleanup_on_drop(&mut forest);
        for name in ["sda2", "sda3", "sda4"] {
            let device = id(cleanup.forest(), name);
            cleanup.map_encrypted(device, &passphrase()).unwrap();
        }
    }

    assert!(mapper.registry().is_empty());
    let closed: Vec<String> = runner
        .calls()
        .iter()
        .filter(|c| c.line().contains("luksClose"))
        .map(Call::line)
        .collect();
    assert_eq!(closed.len(), 3);
    // Newest first
    assert!(closed[0].ends_with("home"));
}

#[test]
fn test_device_usable_after_cleanup_guard() {
    let (_runner, mut mapper) = mapper();
    let mut forest = layout();
    let sda2 = id(&forest, "sda2");
    {
        let mut cleanup = mapper.cleanup_on_drop(&mut forest);
        cleanup.map_encrypted(sda2, &passphrase()).unwrap();
    }

    assert_eq!(mapper.state_of(sda2), MappingState::Closed);
    assert_eq!(forest.device_file(sda2), Some(PathBuf::from("/dev/sda2")));
    assert!(forest.get(sda2).and_then(|d| d.mapped_name()).is_none());

    // Closed devices can be reopened, or reformatted
    let mapped = mapper.open(&mut forest, sda2, &passphrase()).unwrap();
    assert_eq!(mapped, PathBuf::from("/dev/mapper/root"));
    mapper.close_device(&mut forest, sda2).unwrap();
    mapper.format(&forest, sda2, &passphrase()).unwrap();
    assert_eq!(mapper.state_of(sda2), MappingState::Formatted);
}

#[test]
fn test_guard_close_all_reports_and_disarms() {
    let (runner, mut mapper) = mapper();
    runner.fail_when("luksClose root", CommandOutput::failed(5, "busy"));
    let mut forest = layout();
    let sda2 = id(&forest, "sda2");

    let mut cleanup = mapper.cleanup_on_drop(&mut forest);
    cleanup.map_encrypted(sda2, &passphrase()).unwrap();
    let report = cleanup.close_all();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(mapper.state_of(sda2), MappingState::Closed);
    let close_calls = runner
        .calls()
        .iter()
        .filter(|c| c.line().contains("luksClose"))
        .count();
    assert_eq!(close_calls, 1, "the guard must not close a second time");
}

#[test]
fn test_kept_guard_leaves_mappings_open() {
    let (_runner, mut mapper) = mapper();
    let mut forest = layout();
    let sda3 = id(&forest, "sda3");
    {
        let mut cleanup = mapper.cleanup_on_drop(&mut forest);
        cleanup.map_encrypted(sda3, &passphrase()).unwrap();
        cleanup.keep_open();
    }
    assert_eq!(mapper.registry().names(), vec!["var_log"]);
    assert_eq!(mapper.state_of(sda3), MappingState::Opened);
    assert_eq!(forest.device_file(sda3), Some(PathBuf::from("/dev/mapper/var_log")));
}

#[test]
fn test_signal_cleanup_hook_closes_registered_mappings() {
    let (runner, mut mapper) = mapper();
    let mut forest = layout();
    let sda2 = id(&forest, "sda2");

    let hooks_before = cleanup_hook_count();
    let hook = mapper.cleanup_hook();
    assert_eq!(cleanup_hook_count(), hooks_before + 1);

    mapper.map_encrypted(&mut forest, sda2, &passphrase()).unwrap();
    run_cleanup_hooks();

    assert!(mapper.registry().is_empty());
    assert!(runner.calls().iter().any(|c| c.line() == "--batch-mode luksClose root"));
    assert_eq!(mapper.state_of(sda2), MappingState::Closed);

    // The forest catches up once the mapper reconciles
    assert_eq!(mapper.reconcile(&mut forest), vec!["root".to_string()]);
    assert_eq!(forest.device_file(sda2), Some(PathBuf::from("/dev/sda2")));
    assert!(mapper.reconcile(&mut forest).is_empty());

    drop(hook);
    assert_eq!(cleanup_hook_count(), hooks_before);
}

#[test]
fn test_mapping_closed_elsewhere_can_be_reopened() {
    let (_runner, mut mapper) = mapper();
    let mut forest = layout();
    let sda2 = id(&forest, "sda2");

    mapper.map_encrypted(&mut forest, sda2, &passphrase()).unwrap();
    // Another holder of the shared registry closed it
    assert!(mapper.registry().clone().remove("root"));

    let mapped = mapper.open(&mut forest, sda2, &passphrase()).unwrap();
    assert_eq!(mapped, PathBuf::from("/dev/mapper/root"));
    assert_eq!(mapper.state_of(sda2), MappingState::Opened);
}

// =============================================================================
// Dry run
// =============================================================================

#[test]
fn test_dry_run_never_spawns_cryptsetup() {
    let registry = MountedEncrypts::new();
    let mut mapper = EncryptedVolumeMapper::with_binary(
        SystemRunner::dry_run(),
        registry.clone(),
        PathBuf::from("/nonexistent/cryptsetup"),
    );
    let mut forest = layout();
    let sda2 = id(&forest, "sda2");

    let mapped = mapper.map_encrypted(&mut forest, sda2, &passphrase()).unwrap();
    assert_eq!(mapped, PathBuf::from("/dev/mapper/root"));
    assert!(registry.contains("root"));

    let report = mapper.close_all(&mut forest);
    assert!(report.is_clean());
    assert!(registry.is_empty());
}
