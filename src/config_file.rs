//! Storage policy file handling.
//!
//! The policy is a small JSON document. Every field is optional and falls back
//! to its default, so `{}` is a valid policy:
//!
//! ```json
//! {
//!   "min_install_size": "20GiB",
//!   "passphrase": { "min_length": 8, "max_length": 94 },
//!   "cryptsetup_binary": "cryptsetup",
//!   "lsblk_binary": "lsblk"
//! }
//! ```
//!
//! `min_install_size` accepts a byte count or a size string (`"20GiB"`, `"32GB"`).
//! LUKS cipher parameters are fixed in code and cannot be set here.

use anyhow::{Context, Result};
use humanize_rs::bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::passphrase::PassphrasePolicy;

/// Default minimum install size: 20 GiB
pub const DEFAULT_MIN_INSTALL_SIZE: u64 = 20 * 1024 * 1024 * 1024;

/// Upper bound accepted for `passphrase.max_length`
pub const MAX_PASSPHRASE_LENGTH_LIMIT: usize = 512;

/// Parse a human size string (`20GiB`, `500mb`) into bytes.
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let bytes = s
        .trim()
        .to_lowercase()
        .parse::<Bytes>()
        .map_err(|e| format!("bad size {:?}: {}", s, e))?;
    Ok(bytes.size() as u64)
}

fn size_or_string<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Bytes(u64),
        Human(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Bytes(n) => Ok(n),
        SizeValue::Human(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Storage policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Smallest disk or free region (bytes) that can host an install
    #[serde(deserialize_with = "size_or_string")]
    pub min_install_size: u64,
    pub passphrase: PassphrasePolicy,
    pub cryptsetup_binary: PathBuf,
    pub lsblk_binary: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            min_install_size: DEFAULT_MIN_INSTALL_SIZE,
            passphrase: PassphrasePolicy::default(),
            cryptsetup_binary: PathBuf::from("cryptsetup"),
            lsblk_binary: PathBuf::from("lsblk"),
        }
    }
}

impl StorageConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.min_install_size == 0 {
            anyhow::bail!("Minimum install size must be greater than zero");
        }

        let policy = &self.passphrase;
        if policy.min_length < 1 {
            anyhow::bail!("Passphrase minimum length must be at least 1");
        }
        if policy.min_length > policy.max_length {
            anyhow::bail!(
                "Passphrase minimum length ({}) exceeds maximum length ({})",
                policy.min_length,
                policy.max_length
            );
        }
        if policy.max_length > MAX_PASSPHRASE_LENGTH_LIMIT {
            anyhow::bail!(
                "Passphrase maximum length may not exceed {}",
                MAX_PASSPHRASE_LENGTH_LIMIT
            );
        }

        if self.cryptsetup_binary.as_os_str().is_empty() {
            anyhow::bail!("cryptsetup binary must be specified");
        }
        if self.lsblk_binary.as_os_str().is_empty() {
            anyhow::bail!("lsblk binary must be specified");
        }

        Ok(())
    }
}
