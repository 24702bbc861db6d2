//! Process lifecycle and interrupt cleanup
//!
//! Two kinds of state must be unwound when the installer is interrupted:
//!
//! - In-flight tool processes (`cryptsetup luksFormat` half way through a header
//!   write). These are spawned in their own process group and tracked in the
//!   `ChildRegistry` so they can be signalled as a group.
//! - Scoped resources that outlive a single call: a terminal switched to raw
//!   mode while a passphrase is typed, or LUKS mappings opened earlier in the
//!   run. Their owners register a cleanup hook for as long as the resource is
//!   held; the hook is removed again when the `CleanupHandle` is dropped.
//!
//! On SIGINT, SIGTERM, SIGHUP or SIGQUIT the signal listener terminates the
//! tracked children, runs the registered hooks newest first, then exits with
//! `128 + signal`.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static CHILD_REGISTRY: OnceLock<Mutex<ChildRegistry>> = OnceLock::new();

/// Cleanup hooks, keyed by registration id
static CLEANUP_HOOKS: OnceLock<Mutex<Vec<(u64, CleanupHook)>>> = OnceLock::new();

static NEXT_HOOK_ID: AtomicU64 = AtomicU64::new(1);

/// Set once the signal listener thread is running
static SIGNAL_LISTENER: OnceLock<()> = OnceLock::new();

type CleanupHook = Arc<dyn Fn() + Send + Sync + 'static>;

/// Tool processes currently running. Each one leads its own process group.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
}

impl ChildRegistry {
    /// The process-wide registry used by `SystemRunner`
    pub fn global() -> &'static Mutex<ChildRegistry> {
        CHILD_REGISTRY.get_or_init(|| Mutex::new(ChildRegistry::default()))
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!("Tracking tool process group {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// SIGTERM every tracked group, then SIGKILL whatever is still there
    /// after `grace_period`. The registry is empty afterwards.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        let groups: Vec<u32> = self.pids.drain().collect();
        if groups.is_empty() {
            return;
        }
        info!("Terminating {} running tool(s)", groups.len());

        for &pgid in &groups {
            signal_group(pgid, Signal::SIGTERM);
        }

        let deadline = Instant::now() + grace_period;
        while Instant::now() < deadline && groups.iter().any(|&pgid| group_exists(pgid)) {
            std::thread::sleep(Duration::from_millis(50));
        }

        for pgid in groups.into_iter().filter(|&pgid| group_exists(pgid)) {
            warn!("Process group {} ignored SIGTERM, killing it", pgid);
            signal_group(pgid, Signal::SIGKILL);
        }
    }
}

fn signal_group(pgid: u32, signal: Signal) {
    if let Err(e) = signal::killpg(Pid::from_raw(pgid as i32), signal) {
        debug!("{:?} to process group {} failed: {}", signal, pgid, e);
    }
}

fn group_exists(pgid: u32) -> bool {
    signal::killpg(Pid::from_raw(pgid as i32), None).is_ok()
}

// ============================================================================
// Cleanup hooks
// ============================================================================

fn hooks() -> MutexGuard<'static, Vec<(u64, CleanupHook)>> {
    CLEANUP_HOOKS
        .get_or_init(|| Mutex::new(Vec::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deregisters its cleanup hook when dropped.
#[derive(Debug)]
#[must_use = "the cleanup hook is removed as soon as the handle is dropped"]
pub struct CleanupHandle {
    id: u64,
    label: &'static str,
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        hooks().retain(|(id, _)| *id != self.id);
        debug!("Cleanup hook '{}' deregistered", self.label);
    }
}

/// Register a hook to run if the process is interrupted by a signal.
///
/// The hook stays registered until the returned handle is dropped. Hooks run
/// on the signal listener thread, newest first.
pub fn register_cleanup<F>(label: &'static str, hook: F) -> CleanupHandle
where
    F: Fn() + Send + Sync + 'static,
{
    let id = NEXT_HOOK_ID.fetch_add(1, Ordering::Relaxed);
    hooks().push((id, Arc::new(hook)));
    debug!("Cleanup hook '{}' registered", label);
    CleanupHandle { id, label }
}

/// Number of currently registered cleanup hooks
pub fn cleanup_hook_count() -> usize {
    hooks().len()
}

/// Run every registered hook, newest first.
///
/// Hooks are cloned out of the registry before running so a hook may itself
/// drop a `CleanupHandle` without deadlocking.
pub fn run_cleanup_hooks() {
    let snapshot: Vec<CleanupHook> = hooks().iter().rev().map(|(_, hook)| hook.clone()).collect();
    for hook in snapshot {
        hook();
    }
}

// ============================================================================
// Signal listener
// ============================================================================

/// Install the process-wide signal listener. Safe to call more than once.
///
/// Handles SIGINT, SIGTERM, SIGHUP and SIGQUIT: terminates tracked children,
/// runs cleanup hooks, then exits with `128 + signal`.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    if SIGNAL_LISTENER.get().is_some() {
        return Ok(());
    }

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP, SIGQUIT])?;
    if SIGNAL_LISTENER.set(()).is_err() {
        // Lost a race with another caller; its listener is already running.
        signals.handle().close();
        return Ok(());
    }

    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                SIGQUIT => "SIGQUIT",
                _ => "UNKNOWN",
            };

            info!("Received {} signal, cleaning up...", signal_name);

            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(Duration::from_secs(3));
            }

            run_cleanup_hooks();

            std::process::exit(128 + sig);
        }
    });

    debug!("Signal listener installed");
    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Run the command in its own process group, and have it receive SIGTERM
    /// if this process dies first.
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe functions
        // (setpgid, prctl) between fork and exec.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}
