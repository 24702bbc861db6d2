//! Block device inventory
//!
//! The storage core does not walk `/sys` itself. It asks a `DeviceInventory`
//! for a fresh list of raw device descriptors and builds its own tree from
//! them. Two sources are provided:
//!
//! - `LsblkInventory` runs `lsblk --json --bytes` through a `CommandRunner`.
//! - `JsonFileInventory` reads the same JSON document from disk, for scripted
//!   installs and tests.
//!
//! Any failure is reported as `StorageError::Enumeration` and never retried.

use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::command_runner::CommandRunner;
use crate::error::{Result, StorageError};
use crate::tool_args::ToolArgs;

/// Columns requested from lsblk
pub const LSBLK_COLUMNS: &str = "NAME,MODEL,SIZE,RM,RO,TYPE,FSTYPE,MOUNTPOINT";

/// One device as reported by the inventory, with its children nested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDevice {
    /// Kernel name (`sda`, `nvme0n1p2`)
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Size in bytes
    #[serde(default, deserialize_with = "flexible_u64")]
    pub size: u64,
    /// Removable media (USB sticks, SD cards)
    #[serde(default, rename = "rm", deserialize_with = "flexible_bool")]
    pub removable: bool,
    #[serde(default, rename = "ro", deserialize_with = "flexible_bool")]
    pub read_only: bool,
    /// lsblk TYPE column (`disk`, `part`, `crypt`, ...)
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fstype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RawDevice>,
}

/// Top-level lsblk JSON document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LsblkOutput {
    pub blockdevices: Vec<RawDevice>,
}

impl LsblkOutput {
    /// Parse lsblk `--json` output
    pub fn parse(json: &str) -> Result<Vec<RawDevice>> {
        let parsed: LsblkOutput = serde_json::from_str(json)
            .map_err(|e| StorageError::enumeration(format!("cannot parse lsblk output: {}", e)))?;
        Ok(parsed.blockdevices)
    }
}

/// lsblk prints numbers and booleans as strings in older util-linux releases.
#[derive(Deserialize)]
#[serde(untagged)]
enum Flexible {
    Bool(bool),
    Number(u64),
    Text(String),
}

fn flexible_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<Flexible>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Flexible::Number(n)) => Ok(n),
        Some(Flexible::Bool(b)) => Ok(u64::from(b)),
        Some(Flexible::Text(s)) if s.trim().is_empty() => Ok(0),
        Some(Flexible::Text(s)) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("expected a byte count, got {:?}", s))),
    }
}

fn flexible_bool<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<Flexible>::deserialize(deserializer)? {
        None => Ok(false),
        Some(Flexible::Bool(b)) => Ok(b),
        Some(Flexible::Number(n)) => Ok(n != 0),
        Some(Flexible::Text(s)) => match s.trim() {
            "1" | "true" => Ok(true),
            "0" | "false" | "" => Ok(false),
            other => Err(D::Error::custom(format!("expected a boolean, got {:?}", other))),
        },
    }
}

/// Supplies raw device descriptors.
pub trait DeviceInventory {
    /// List all block devices currently present.
    fn rescan(&self) -> Result<Vec<RawDevice>>;
}

/// Typed arguments for the lsblk listing
#[derive(Debug, Clone, Default)]
pub struct LsblkArgs;

impl ToolArgs for LsblkArgs {
    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--json".to_string(),
            "--bytes".to_string(),
            "--output".to_string(),
            LSBLK_COLUMNS.to_string(),
        ]
    }

    fn tool_name(&self) -> &'static str {
        "lsblk"
    }

    /// Listing devices never touches them.
    fn is_destructive(&self) -> bool {
        false
    }
}

/// Inventory backed by `lsblk`
#[derive(Debug, Clone)]
pub struct LsblkInventory<R> {
    runner: R,
    binary: PathBuf,
}

impl<R: CommandRunner> LsblkInventory<R> {
    pub fn new(runner: R) -> Self {
        Self::with_binary(runner, PathBuf::from("lsblk"))
    }

    pub fn with_binary(runner: R, binary: PathBuf) -> Self {
        Self { runner, binary }
    }
}

impl<R: CommandRunner> DeviceInventory for LsblkInventory<R> {
    fn rescan(&self) -> Result<Vec<RawDevice>> {
        let command = LsblkArgs.to_command(&self.binary);
        let output = self
            .runner
            .run(&command)
            .map_err(|e| StorageError::enumeration(format!("{}: {}", command, e)))?;

        if !output.success {
            return Err(StorageError::enumeration(format!(
                "{} exited with code {}: {}",
                command,
                output.exit_code.unwrap_or(-1),
                output.combined()
            )));
        }

        let devices = LsblkOutput::parse(&output.stdout)?;
        info!("Inventory rescan found {} top-level device(s)", devices.len());
        Ok(devices)
    }
}

/// Inventory read from a saved lsblk JSON document
#[derive(Debug, Clone)]
pub struct JsonFileInventory {
    path: PathBuf,
}

impl JsonFileInventory {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl DeviceInventory for JsonFileInventory {
    fn rescan(&self) -> Result<Vec<RawDevice>> {
        debug!("Reading device inventory from {:?}", self.path);
        let content = fs::read_to_string(&self.path).map_err(|e| {
            StorageError::enumeration(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        LsblkOutput::parse(&content)
    }
}
