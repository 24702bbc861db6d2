//! Passphrase intake and validation
//!
//! # Validation
//!
//! A passphrase is accepted if it is non-empty, uses only 7-bit printable
//! characters (32..=126) and its length is within the policy bounds
//! (8..=94 by default). Rules are checked in that order and the first failure
//! is reported. The input is taken as-is: no trimming.
//!
//! # Interactive capture
//!
//! `PassphrasePrompt` loops: prompt, read without echo, validate, print the
//! reason and ask again. A read error or an interrupt (Ctrl-C, Ctrl-D, Esc)
//! ends the loop with `None`.
//!
//! While a secret is being read the terminal is in raw mode under a
//! `TerminalGuard`. The guard restores the terminal on drop and, for as long
//! as it lives, keeps a process cleanup hook registered so a SIGTERM or SIGHUP
//! mid-read also restores it before the process exits.
//!
//! Accepted passphrases are wrapped in `Passphrase`, which zeroes its memory
//! on drop and never prints its content.

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, BufRead, Write};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{Result, StorageError};
use crate::process_guard::{CleanupHandle, init_signal_handlers, register_cleanup};

/// Minimum passphrase length in characters
pub const MIN_PASSPHRASE_LENGTH: usize = 8;

/// Maximum passphrase length in characters
pub const MAX_PASSPHRASE_LENGTH: usize = 94;

pub const PASSPHRASE_PROMPT: &str = "Disk Encryption Passphrase: ";

/// Why a passphrase was rejected. `Display` gives the message shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PassphraseRejection {
    #[error("Passphrase is required")]
    Empty,

    #[error("Passphrase may only contain 7-bit, printable characters")]
    NotPrintable,

    #[error("Passphrase must be at least {min} characters long")]
    TooShort { min: usize },

    #[error("Passphrase may be at most {max} characters long")]
    TooLong { max: usize },
}

/// A validated passphrase. Zeroed on drop.
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    /// The secret itself. Only hand this to a tool's stdin.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// Length bounds for passphrases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassphrasePolicy {
    pub min_length: usize,
    pub max_length: usize,
}

impl Default for PassphrasePolicy {
    fn default() -> Self {
        Self {
            min_length: MIN_PASSPHRASE_LENGTH,
            max_length: MAX_PASSPHRASE_LENGTH,
        }
    }
}

fn is_printable(phrase: &str) -> bool {
    phrase.chars().all(|c| (' '..='~').contains(&c))
}

impl PassphrasePolicy {
    pub fn validate(&self, phrase: &str) -> std::result::Result<(), PassphraseRejection> {
        if phrase.is_empty() {
            return Err(PassphraseRejection::Empty);
        }
        if !is_printable(phrase) {
            return Err(PassphraseRejection::NotPrintable);
        }
        // All characters are ASCII from here on, so bytes == characters.
        if phrase.len() < self.min_length {
            return Err(PassphraseRejection::TooShort { min: self.min_length });
        }
        if phrase.len() > self.max_length {
            return Err(PassphraseRejection::TooLong { max: self.max_length });
        }
        Ok(())
    }

    /// Validity plus the reason it failed (empty when valid)
    pub fn check(&self, phrase: &str) -> (bool, String) {
        match self.validate(phrase) {
            Ok(()) => (true, String::new()),
            Err(reason) => (false, reason.to_string()),
        }
    }

    /// Validate and take ownership of the secret
    pub fn accept(&self, phrase: &str) -> std::result::Result<Passphrase, PassphraseRejection> {
        self.validate(phrase)?;
        Ok(Passphrase(Zeroizing::new(phrase.to_string())))
    }
}

/// Check `phrase` against the default policy.
pub fn is_valid_passphrase(phrase: &str) -> (bool, String) {
    PassphrasePolicy::default().check(phrase)
}

// ============================================================================
// Terminal handling
// ============================================================================

/// Holds the terminal in raw mode and restores it when dropped.
pub struct TerminalGuard {
    restore: fn() -> io::Result<()>,
    _restore_hook: CleanupHandle,
}

impl TerminalGuard {
    /// Switch the controlling terminal to raw mode
    pub fn acquire() -> Result<Self> {
        if let Err(e) = init_signal_handlers() {
            warn!("Failed to initialize signal handlers: {}", e);
        }
        Self::with_modes(enable_raw_mode, disable_raw_mode)
    }

    /// Enter a terminal mode with `enter` and leave it with `restore`.
    ///
    /// `restore` is registered as a cleanup hook before `enter` runs, so
    /// there is no window where a signal leaves the terminal raw. The hook is
    /// removed when the guard drops.
    pub fn with_modes(enter: fn() -> io::Result<()>, restore: fn() -> io::Result<()>) -> Result<Self> {
        let restore_hook = register_cleanup("restore terminal", move || {
            let _ = restore();
        });

        enter().map_err(|e| StorageError::terminal(format!("cannot enable raw mode: {}", e)))?;
        debug!("Terminal switched to raw mode");

        Ok(Self {
            restore,
            _restore_hook: restore_hook,
        })
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        match (self.restore)() {
            Ok(()) => debug!("Terminal restored"),
            Err(e) => warn!("Failed to restore terminal: {}", e),
        }
    }
}

/// Somewhere a secret line can be read from without echo.
pub trait SecretSource {
    /// Read one secret line. `Err` on read failure or interrupt.
    fn read_secret(&mut self) -> Result<Zeroizing<String>>;
}

/// What a keystroke did to the line being typed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    Continue,
    Submit,
    Interrupt,
}

/// Line editor for a secret typed in raw mode.
///
/// Holds at most one character more than `max_length`. Anything typed past
/// that is counted but not stored, so an overlong entry still fails
/// validation as too long instead of being cut down to an acceptable key.
pub struct SecretBuffer {
    text: Zeroizing<String>,
    stored: usize,
    overflow: usize,
    limit: usize,
}

impl SecretBuffer {
    pub fn new(max_length: usize) -> Self {
        let limit = max_length.saturating_add(1);
        Self {
            // Pushes must not reallocate: an abandoned buffer would not be zeroed.
            text: Zeroizing::new(String::with_capacity(4 * limit)),
            stored: 0,
            overflow: 0,
            limit,
        }
    }

    pub fn apply(&mut self, key: KeyEvent) -> KeyOutcome {
        if key.kind == KeyEventKind::Release {
            return KeyOutcome::Continue;
        }
        let control = key.modifiers.contains(KeyModifiers::CONTROL);

        match key.code {
            KeyCode::Enter => KeyOutcome::Submit,
            KeyCode::Esc => KeyOutcome::Interrupt,
            KeyCode::Char('c') | KeyCode::Char('d') if control => KeyOutcome::Interrupt,
            // Other chords (Ctrl-U, Ctrl-W, ...) are not text
            KeyCode::Char(_) if control => KeyOutcome::Continue,
            KeyCode::Backspace => {
                if self.overflow > 0 {
                    self.overflow -= 1;
                } else if self.text.pop().is_some() {
                    self.stored -= 1;
                }
                KeyOutcome::Continue
            }
            KeyCode::Char(c) => {
                if self.stored < self.limit {
                    self.text.push(c);
                    self.stored += 1;
                } else {
                    self.overflow += 1;
                }
                KeyOutcome::Continue
            }
            _ => KeyOutcome::Continue,
        }
    }

    pub fn into_secret(self) -> Zeroizing<String> {
        self.text
    }
}

/// Reads keystrokes from the controlling terminal in raw mode.
#[derive(Debug)]
pub struct TerminalSecretSource {
    max_length: usize,
}

impl TerminalSecretSource {
    /// Source for passphrases of up to `max_length` characters
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl Default for TerminalSecretSource {
    fn default() -> Self {
        Self::new(MAX_PASSPHRASE_LENGTH)
    }
}

impl SecretSource for TerminalSecretSource {
    fn read_secret(&mut self) -> Result<Zeroizing<String>> {
        let _guard = TerminalGuard::acquire()?;
        let mut buffer = SecretBuffer::new(self.max_length);

        loop {
            let event = event::read()
                .map_err(|e| StorageError::terminal(format!("cannot read from terminal: {}", e)))?;
            let Event::Key(key) = event else {
                continue;
            };
            match buffer.apply(key) {
                KeyOutcome::Continue => {}
                KeyOutcome::Submit => return Ok(buffer.into_secret()),
                KeyOutcome::Interrupt => return Err(StorageError::terminal("interrupted")),
            }
        }
    }
}

/// Prompt loop around a `SecretSource`
pub struct PassphrasePrompt<S, W> {
    source: S,
    out: W,
    policy: PassphrasePolicy,
}

impl<S: SecretSource, W: Write> PassphrasePrompt<S, W> {
    pub fn new(source: S, out: W, policy: PassphrasePolicy) -> Self {
        Self { source, out, policy }
    }

    /// Ask until a valid passphrase is entered. `None` if reading fails.
    pub fn run(&mut self) -> Option<Passphrase> {
        loop {
            if write!(self.out, "{}", PASSPHRASE_PROMPT)
                .and_then(|_| self.out.flush())
                .is_err()
            {
                return None;
            }

            let read = self.source.read_secret();
            let _ = writeln!(self.out);

            match read {
                Ok(candidate) => match self.policy.accept(&candidate) {
                    Ok(passphrase) => {
                        debug!("Passphrase accepted ({} characters)", passphrase.len());
                        return Some(passphrase);
                    }
                    Err(reason) => {
                        let _ = writeln!(self.out, "{}", reason);
                    }
                },
                Err(e) => {
                    warn!("Passphrase capture aborted: {}", e);
                    let _ = writeln!(self.out, "Error getting passphrase: {}", e);
                    return None;
                }
            }
        }
    }
}

/// Prompt on the controlling terminal, writing prompts to stderr.
pub fn ask_passphrase(policy: PassphrasePolicy) -> Option<Passphrase> {
    PassphrasePrompt::new(TerminalSecretSource::new(policy.max_length), io::stderr(), policy).run()
}

/// Read one line from `reader` (scripted installs) and validate it.
///
/// Only the line terminator is removed.
pub fn read_passphrase_line<R: BufRead>(mut reader: R, policy: &PassphrasePolicy) -> Result<Passphrase> {
    let mut line = Zeroizing::new(String::new());
    reader.read_line(&mut line)?;
    let phrase = line
        .strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(line.as_str());
    Ok(policy.accept(phrase)?)
}
