//! External command execution
//!
//! Every privileged tool the storage core needs (`lsblk`, `cryptsetup`) is run
//! through a `CommandRunner`. The system implementation:
//!
//! - spawns the tool in its own process group and registers its PID with the
//!   global `ChildRegistry`, so an interrupt can terminate it;
//! - feeds secrets over a private stdin pipe only, never argv or environment;
//! - captures stdout and stderr for error reporting;
//! - in dry-run mode, logs destructive commands instead of running them.
//!
//! Tests substitute their own `CommandRunner` to record invocations.

use std::io::Write;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError};
use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use crate::tool_args::ToolCommand;

/// Output from a tool execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output from the tool.
    pub stdout: String,
    /// Standard error from the tool.
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the tool exited successfully (exit code 0).
    pub success: bool,
}

impl CommandOutput {
    /// Successful output carrying `stdout`
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
            success: false,
        }
    }

    /// stderr and stdout joined, the way a log reader wants to see them
    pub fn combined(&self) -> String {
        match (self.stderr.trim(), self.stdout.trim()) {
            ("", out) => out.to_string(),
            (err, "") => err.to_string(),
            (err, out) => format!("{}\n{}", err, out),
        }
    }

    /// Check if the tool succeeded and return a `StorageError::Tool` if not.
    pub fn ensure_success(self, operation: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(StorageError::tool(operation, self.exit_code, self.combined()))
        }
    }
}

/// Runs external tools on behalf of the storage core.
pub trait CommandRunner: Send + Sync {
    /// Run a command and capture its output. A non-zero exit is reported in
    /// `CommandOutput::success`, not as `Err`; `Err` means the tool could not
    /// be started at all.
    fn run(&self, command: &ToolCommand) -> Result<CommandOutput>;

    /// Run a command with `secret` written to its stdin.
    ///
    /// Implementations must never place the secret in argv or the environment.
    fn run_with_stdin(&self, secret: &[u8], command: &ToolCommand) -> Result<CommandOutput>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for std::sync::Arc<R> {
    fn run(&self, command: &ToolCommand) -> Result<CommandOutput> {
        (**self).run(command)
    }

    fn run_with_stdin(&self, secret: &[u8], command: &ToolCommand) -> Result<CommandOutput> {
        (**self).run_with_stdin(secret, command)
    }
}

/// Runs tools as real child processes.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    dry_run: bool,
}

impl SystemRunner {
    /// Create a runner that executes commands
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a runner that skips destructive commands
    pub fn dry_run() -> Self {
        Self { dry_run: true }
    }

    /// Whether destructive commands are skipped
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn execute(&self, command: &ToolCommand, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        if self.dry_run && command.destructive {
            info!("[dry-run] would run: {}", command);
            return Ok(CommandOutput::ok(""));
        }

        // The command line never contains secrets, so it is safe to log.
        info!("Running: {}", command);

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .in_new_process_group();

        let mut child = cmd.spawn().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to spawn {}: {}", command.program.display(), e),
            ))
        })?;
        let pid = child.id();

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }

        if let Some(secret) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                debug!("Writing {} byte(s) to stdin of PID {}", secret.len(), pid);
                if let Err(e) = pipe.write_all(secret) {
                    // The tool may have exited early; its exit status says why.
                    warn!("Failed to write to stdin of {}: {}", command.program.display(), e);
                }
                // Dropping the pipe sends EOF
            }
        }

        let waited = child.wait_with_output();

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(pid);
        }

        let output = waited?;
        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            success: output.status.success(),
        };

        if result.success {
            debug!("{} exited successfully", command.program.display());
        } else {
            warn!(
                "{} failed with exit code {}",
                command.program.display(),
                result.exit_code.unwrap_or(-1)
            );
        }

        Ok(result)
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, command: &ToolCommand) -> Result<CommandOutput> {
        self.execute(command, None)
    }

    fn run_with_stdin(&self, secret: &[u8], command: &ToolCommand) -> Result<CommandOutput> {
        self.execute(command, Some(secret))
    }
}
