//! Pre-flight sanity checks for runtime environment
//!
//! Before any command that touches disks, the front end verifies:
//! - `lsblk` and `cryptsetup` are present
//! - we are running with root privileges (EUID 0)
//!
//! Read-only commands (`targets` with an inventory file, `check-passphrase`)
//! skip these checks.

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use crate::config_file::StorageConfig;
use crate::process_guard::CommandProcessGroup;

/// Environment variable that disables the root check for development
pub const SKIP_ROOT_CHECK_ENV: &str = "INSTALLER_STORAGE_SKIP_ROOT_CHECK";

/// Result of environment verification
#[derive(Debug)]
pub struct SanityCheckResult {
    pub missing_binaries: Vec<String>,
    pub is_root: bool,
}

impl SanityCheckResult {
    /// Returns true if all checks passed
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root
    }

    /// Human-readable description of every failed check
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.is_root {
            problems.push(
                "Root privileges required to open and format encrypted volumes (run with sudo)"
                    .to_string(),
            );
        }
        for binary in &self.missing_binaries {
            problems.push(format!(
                "Missing required binary: {} (package: {})",
                binary,
                package_for_binary(binary)
            ));
        }
        problems
    }
}

/// Check if a binary is available, either as a path or in PATH
fn binary_exists(binary: &Path) -> bool {
    if binary.components().count() > 1 {
        return binary.is_file();
    }
    Command::new("which")
        .arg(binary)
        .in_new_process_group()
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Binaries the storage core shells out to
pub fn required_binaries(config: &StorageConfig) -> Vec<PathBuf> {
    vec![config.lsblk_binary.clone(), config.cryptsetup_binary.clone()]
}

/// Perform all sanity checks and return the result
pub fn verify_environment(config: &StorageConfig) -> SanityCheckResult {
    let missing_binaries = required_binaries(config)
        .into_iter()
        .filter(|binary| !binary_exists(binary))
        .map(|binary| binary.display().to_string())
        .collect();

    SanityCheckResult {
        missing_binaries,
        is_root: is_running_as_root(),
    }
}

/// Map binary names to the distribution package that ships them
fn package_for_binary(binary: &str) -> &'static str {
    let name = Path::new(binary)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(binary);
    match name {
        "lsblk" => "util-linux",
        "cryptsetup" => "cryptsetup",
        _ => "unknown",
    }
}

/// Skip root check (for development/testing)
/// Set INSTALLER_STORAGE_SKIP_ROOT_CHECK=1 to skip
pub fn should_skip_root_check() -> bool {
    std::env::var(SKIP_ROOT_CHECK_ENV)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// Run pre-flight checks, honouring the root-check override.
pub fn run_preflight_checks(config: &StorageConfig) -> SanityCheckResult {
    debug!("Running pre-flight sanity checks...");

    let mut result = verify_environment(config);
    if !result.is_root && should_skip_root_check() {
        warn!("Root check skipped ({}=1)", SKIP_ROOT_CHECK_ENV);
        result.is_root = true;
    }

    if result.is_ok() {
        info!("Pre-flight checks passed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_exists() {
        assert!(binary_exists(Path::new("sh")));
        assert!(binary_exists(Path::new("/bin/sh")));
        assert!(!binary_exists(Path::new("this_binary_definitely_does_not_exist_12345")));
        assert!(!binary_exists(Path::new("/nonexistent/bin/cryptsetup")));
    }

    #[test]
    fn test_missing_configured_binary_is_reported() {
        let config = StorageConfig {
            cryptsetup_binary: PathBuf::from("/nonexistent/cryptsetup"),
            ..Default::default()
        };
        let result = verify_environment(&config);
        assert!(result.missing_binaries.contains(&"/nonexistent/cryptsetup".to_string()));
        assert!(!result.is_ok());
        assert!(
            result
                .problems()
                .iter()
                .any(|p| p.contains("package: cryptsetup"))
        );
    }

    #[test]
    fn test_package_mapping() {
        assert_eq!(package_for_binary("lsblk"), "util-linux");
        assert_eq!(package_for_binary("/usr/sbin/cryptsetup"), "cryptsetup");
        assert_eq!(package_for_binary("mystery"), "unknown");
    }

    #[test]
    fn test_sanity_result_is_ok() {
        let ok_result = SanityCheckResult {
            missing_binaries: vec![],
            is_root: true,
        };
        assert!(ok_result.is_ok());
        assert!(ok_result.problems().is_empty());

        let not_root = SanityCheckResult {
            missing_binaries: vec![],
            is_root: false,
        };
        assert!(!not_root.is_ok());
        assert_eq!(not_root.problems().len(), 1);
    }
}
