//! Type-safe external tool argument contracts.
//!
//! This module provides the `ToolArgs` trait for ensuring compile-time correctness
//! of the arguments handed to privileged tools (`cryptsetup`, `lsblk`). Instead of
//! raw string vectors, Rust structs implement this trait to produce the exact argv.
//!
//! Secrets never appear here: anything sensitive travels over the child's stdin
//! (see `CommandRunner::run_with_stdin`).

use std::fmt;
use std::path::{Path, PathBuf};

/// Trait for typed tool arguments.
///
/// # Contract
///
/// - `to_cli_args()`: Returns the arguments exactly as the tool expects them,
///   without the program name.
/// - `tool_name()`: Returns the default binary name (e.g. "cryptsetup").
/// - `is_destructive()`: True if running the tool can destroy data. Dry-run
///   mode skips destructive commands but still runs read-only ones.
///
/// # Example
///
/// ```ignore
/// use installer_storage::crypt::args::LuksCloseArgs;
/// use installer_storage::tool_args::ToolArgs;
///
/// let args = LuksCloseArgs { mapper_name: "home".to_string() };
/// let cli_args = args.to_cli_args(); // ["--batch-mode", "luksClose", "home"]
/// ```
pub trait ToolArgs {
    /// Convert struct fields to CLI arguments.
    fn to_cli_args(&self) -> Vec<String>;

    /// Default binary name for this tool.
    fn tool_name(&self) -> &'static str;

    /// Whether the command modifies on-disk data.
    fn is_destructive(&self) -> bool;

    /// Build a runnable command using `binary` in place of the default tool name.
    fn to_command(&self, binary: &Path) -> ToolCommand {
        ToolCommand {
            program: binary.to_path_buf(),
            args: self.to_cli_args(),
            destructive: self.is_destructive(),
        }
    }

    /// Build a runnable command using the default tool name.
    fn to_default_command(&self) -> ToolCommand {
        self.to_command(Path::new(self.tool_name()))
    }
}

/// A fully resolved command line, ready for a `CommandRunner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    /// Program to execute (name resolved through PATH, or absolute path)
    pub program: PathBuf,
    /// Arguments, excluding the program
    pub args: Vec<String>,
    /// Whether dry-run mode must skip this command
    pub destructive: bool,
}

impl ToolCommand {
    /// The subcommand-ish operation used to label errors, e.g.
    /// `cryptsetup luksOpen /dev/sda2 home -`.
    pub fn operation(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoArgs {
        words: Vec<&'static str>,
    }

    impl ToolArgs for EchoArgs {
        fn to_cli_args(&self) -> Vec<String> {
            self.words.iter().map(|w| w.to_string()).collect()
        }

        fn tool_name(&self) -> &'static str {
            "echo"
        }

        fn is_destructive(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_default_command_uses_tool_name() {
        let args = EchoArgs { words: vec!["hello", "world"] };
        let cmd = args.to_default_command();
        assert_eq!(cmd.program, PathBuf::from("echo"));
        assert_eq!(cmd.args, vec!["hello".to_string(), "world".to_string()]);
        assert!(!cmd.destructive);
    }

    #[test]
    fn test_binary_override() {
        let args = EchoArgs { words: vec!["x"] };
        let cmd = args.to_command(Path::new("/usr/bin/echo"));
        assert_eq!(cmd.to_string(), "/usr/bin/echo x");
    }

    #[test]
    fn test_operation_label_is_full_command_line() {
        let args = EchoArgs { words: vec![] };
        assert_eq!(args.to_default_command().operation(), "echo");
    }
}
