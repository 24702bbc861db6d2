//! installer-storage - main entry point
//!
//! Text-mode front end over the storage core: lists install targets, sets up
//! encrypted partitions and closes mappings.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use installer_storage::cli::{Cli, Commands};
use installer_storage::config_file::StorageConfig;
use installer_storage::crypt::{EncryptedVolumeMapper, MountedEncrypts, mapping_name};
use installer_storage::engine::device::DeviceForest;
use installer_storage::engine::resolver::{InstallTarget, TargetListing, format_size, selection_summary};
use installer_storage::inventory::{DeviceInventory, JsonFileInventory, LsblkInventory};
use installer_storage::passphrase::{ask_passphrase, read_passphrase_line};
use installer_storage::{SystemRunner, process_guard, sanity};

/// Initialize the logger. Logs go to stderr so stdout stays parseable.
fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logger(cli.verbose);
    debug!("CLI arguments parsed");

    // Tools are terminated and mappings closed if we receive SIGINT/SIGTERM
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    let runner = if cli.dry_run {
        info!("Dry-run mode: cryptsetup commands will be logged, not executed");
        SystemRunner::dry_run()
    } else {
        SystemRunner::new()
    };

    match cli.command {
        Commands::Validate { policy } => {
            run_validate(&policy);
            Ok(())
        }
        Commands::CheckPassphrase => {
            let config = load_config(cli.config.as_deref())?;
            run_check_passphrase(&config)
        }
        Commands::Targets {
            json,
            inventory,
            min_size,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let min_size = min_size.unwrap_or(config.min_install_size);
            let forest = scan(&config, &runner, inventory.as_deref())?;
            run_targets(&forest, min_size, json)
        }
        Commands::Encrypt {
            devices,
            mount_points,
            passphrase_stdin,
            keep_open,
            inventory,
        } => {
            let config = load_config(cli.config.as_deref())?;
            if !cli.dry_run {
                preflight(&config);
            }
            let mut forest = scan(&config, &runner, inventory.as_deref())?;
            run_encrypt(
                &config,
                runner,
                &mut forest,
                &devices,
                &mount_points,
                passphrase_stdin,
                keep_open,
            )
        }
        Commands::Close { names } => {
            let config = load_config(cli.config.as_deref())?;
            if !cli.dry_run {
                preflight(&config);
            }
            run_close(&config, runner, &names)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<StorageConfig> {
    let Some(path) = path else {
        return Ok(StorageConfig::default());
    };
    info!("Loading storage policy from: {:?}", path);
    let config = StorageConfig::load_from_file(path)?;
    config
        .validate()
        .with_context(|| format!("Invalid storage policy {:?}", path))?;
    Ok(config)
}

/// Exit with a readable report if the environment cannot run cryptsetup
fn preflight(config: &StorageConfig) {
    let result = sanity::run_preflight_checks(config);
    if result.is_ok() {
        return;
    }
    eprintln!("✗ Pre-flight check failed");
    for problem in result.problems() {
        eprintln!("   • {}", problem);
    }
    std::process::exit(1);
}

fn scan(config: &StorageConfig, runner: &SystemRunner, inventory: Option<&Path>) -> Result<DeviceForest> {
    let devices = match inventory {
        Some(path) => JsonFileInventory::new(path).rescan(),
        None => LsblkInventory::with_binary(runner.clone(), config.lsblk_binary.clone()).rescan(),
    }
    .context("Failed to list block devices")?;
    let forest = DeviceForest::from_inventory(&devices);
    debug!("Device forest has {} node(s)", forest.len());
    Ok(forest)
}

fn run_validate(path: &Path) {
    info!("Validating storage policy: {:?}", path);
    match StorageConfig::load_from_file(path) {
        Ok(config) => match config.validate() {
            Ok(()) => {
                info!("Storage policy validation successful");
                println!("✓ Storage policy is valid: {:?}", path);
            }
            Err(e) => {
                error!("Storage policy validation failed: {}", e);
                eprintln!("✗ Storage policy validation failed: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!("Failed to load storage policy: {:#}", e);
            eprintln!("✗ Failed to load storage policy: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run_check_passphrase(config: &StorageConfig) -> Result<()> {
    let mut line = Zeroizing::new(String::new());
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read passphrase from stdin")?;
    let phrase = line
        .strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(line.as_str());

    let (valid, reason) = config.passphrase.check(phrase);
    if valid {
        println!("✓ Passphrase is valid");
        Ok(())
    } else {
        println!("✗ {}", reason);
        std::process::exit(1);
    }
}

#[derive(Serialize)]
struct TargetsReport<'a> {
    min_install_size: u64,
    safe: &'a [InstallTarget],
    destructive: &'a [InstallTarget],
    encrypted_disks: Vec<&'a str>,
    required_bundles: Vec<&'static str>,
    summary: String,
}

fn run_targets(forest: &DeviceForest, min_size: u64, json: bool) -> Result<()> {
    let listing = TargetListing::resolve(min_size, forest);
    let encrypted_disks: Vec<&str> = forest
        .roots()
        .iter()
        .filter(|&&id| forest.encryption_enabled(id))
        .filter_map(|&id| forest.get(id).map(|d| d.name.as_str()))
        .collect();
    let preferred = listing.safe.first().or(listing.destructive.first());
    let summary = selection_summary(preferred);

    if json {
        let report = TargetsReport {
            min_install_size: min_size,
            safe: &listing.safe,
            destructive: &listing.destructive,
            encrypted_disks,
            required_bundles: forest.required_bundles(),
            summary,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Minimum install size: {}", format_size(min_size));
        print_targets("Safe targets (free space)", &listing.safe);
        print_targets("Destructive targets (whole disk is wiped)", &listing.destructive);
        if !encrypted_disks.is_empty() {
            println!("Encryption in use on: {}", encrypted_disks.join(", "));
        }
        for bundle in forest.required_bundles() {
            println!("Required bundle: {}", bundle);
        }
        println!("{}", summary);
    }

    if listing.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_targets(heading: &str, targets: &[InstallTarget]) {
    println!("{}:", heading);
    if targets.is_empty() {
        println!("  (none)");
    }
    for target in targets {
        println!(
            "  {:<10} {:<28} {:>12}{}",
            target.device_file(),
            target.friendly,
            format_size(target.capacity),
            if target.removable { "  [removable]" } else { "" }
        );
    }
}

fn run_encrypt(
    config: &StorageConfig,
    runner: SystemRunner,
    forest: &mut DeviceForest,
    devices: &[String],
    mount_points: &[PathBuf],
    passphrase_stdin: bool,
    keep_open: bool,
) -> Result<()> {
    if devices.len() != mount_points.len() {
        bail!(
            "Every --device needs a matching --mount-point ({} device(s), {} mount point(s))",
            devices.len(),
            mount_points.len()
        );
    }

    let mut names: HashMap<String, &str> = HashMap::new();
    let mut ids = Vec::with_capacity(devices.len());
    for (device, mount_point) in devices.iter().zip(mount_points) {
        let name = mapping_name(&mount_point.to_string_lossy());
        if let Some(other) = names.insert(name.clone(), device) {
            bail!("{} and {} would both be mapped as '{}'", other, device, name);
        }

        let id = forest
            .find(device)
            .with_context(|| format!("No block device named {}", device))?;
        forest.mark_for_encryption(id, mount_point.clone())?;
        ids.push(id);
    }

    let passphrase = if passphrase_stdin {
        read_passphrase_line(io::stdin().lock(), &config.passphrase)?
    } else {
        match ask_passphrase(config.passphrase) {
            Some(passphrase) => passphrase,
            None => bail!("No passphrase entered"),
        }
    };

    let mut mapper = EncryptedVolumeMapper::with_binary(
        runner,
        MountedEncrypts::new(),
        config.cryptsetup_binary.clone(),
    );
    let _signal_cleanup = mapper.cleanup_hook();
    let mut cleanup = mapper.cleanup_on_drop(forest);

    for &id in &ids {
        let name = cleanup.forest().device(id)?.name.clone();
        let mapped = cleanup
            .map_encrypted(id, &passphrase)
            .with_context(|| format!("Failed to set up encryption on {}", name))?;
        println!("/dev/{} -> {}", name, mapped.display());
    }

    for bundle in cleanup.forest().required_bundles() {
        println!("Required bundle: {}", bundle);
    }

    if keep_open {
        info!("Leaving {} mapping(s) open", cleanup.mapper().registry().len());
        cleanup.keep_open();
        return Ok(());
    }

    let report = cleanup.close_all();
    if !report.is_clean() {
        bail!("{} mapping(s) could not be closed", report.failed.len());
    }
    Ok(())
}

fn run_close(config: &StorageConfig, runner: SystemRunner, names: &[String]) -> Result<()> {
    let registry = MountedEncrypts::new();
    for name in names {
        registry.record(name)?;
    }

    let mut mapper =
        EncryptedVolumeMapper::with_binary(runner, registry, config.cryptsetup_binary.clone());
    let report = mapper.close_all(&mut DeviceForest::default());

    for name in &report.closed {
        println!("✓ Closed {}", name);
    }
    for (name, e) in &report.failed {
        eprintln!("✗ Failed to close {}: {}", name, e);
    }
    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}
