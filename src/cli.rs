use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config_file::parse_size;

/// installer-storage - install target selection and disk encryption
#[derive(Parser)]
#[command(name = "installer-storage")]
#[command(about = "Find install targets and set up LUKS-encrypted partitions")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// In this mode, cryptsetup format/open/close are skipped and logged.
    /// Device listing still runs so the preview is realistic.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Storage policy file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List disks that can host an installation
    Targets {
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,

        /// Read the device list from a saved `lsblk --json` file
        #[arg(long)]
        inventory: Option<PathBuf>,

        /// Minimum install size (e.g. 20GiB), overrides the policy file
        #[arg(long, value_parser = parse_size)]
        min_size: Option<u64>,
    },
    /// Format and open encrypted partitions
    Encrypt {
        /// Partition to encrypt (repeatable, paired with --mount-point)
        #[arg(long = "device", required = true)]
        devices: Vec<String>,

        /// Mount point for the matching --device (repeatable)
        #[arg(long = "mount-point", required = true)]
        mount_points: Vec<PathBuf>,

        /// Read the passphrase from the first line of stdin instead of prompting
        #[arg(long)]
        passphrase_stdin: bool,

        /// Leave the mappings open on exit
        #[arg(long)]
        keep_open: bool,

        /// Read the device list from a saved `lsblk --json` file
        #[arg(long)]
        inventory: Option<PathBuf>,
    },
    /// Close encrypted mappings by name
    Close {
        /// Mapping names under /dev/mapper
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Check a passphrase read from stdin against the policy
    CheckPassphrase,
    /// Validate a storage policy file
    Validate {
        /// Path to policy file to validate
        policy: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
