use std::io::Write;

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use thiserror::Error;

use crate::session::{EmulatorFactory, TerminalEmulator, TerminalPrefs, TerminalSize};

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),
    #[error("failed to query terminal size: {0}")]
    Size(#[source] std::io::Error),
}

/// RAII guard for terminal raw mode.
///
/// When created, enables raw mode on the terminal. When dropped (even on panic),
/// restores the terminal to its previous state.
///
/// Raw mode is needed to capture all keystrokes (including Ctrl+C, etc.) and
/// forward them to the remote terminal instead of having the local terminal
/// handle them.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Current size of the local terminal.
pub fn terminal_size() -> Result<TerminalSize, TerminalError> {
    let (cols, rows) = size().map_err(TerminalError::Size)?;
    Ok(TerminalSize::new(cols, rows))
}

/// Writes one session's output straight to stdout. The local terminal is
/// the emulator, so there is nothing to keep.
pub struct StdoutEmulatorFactory;

struct StdoutEmulator;

impl TerminalEmulator for StdoutEmulator {
    fn write(&mut self, bytes: &[u8]) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(bytes);
        let _ = out.flush();
    }

    fn clear(&mut self) {
        // ED2 + cursor home
        self.write(b"\x1b[2J\x1b[H");
    }

    fn measure(&self, _prefs: &TerminalPrefs) -> Option<TerminalSize> {
        terminal_size().ok()
    }

    fn dispose(&mut self) {}
}

impl EmulatorFactory for StdoutEmulatorFactory {
    fn create(&self, _: &str, _: &str, _: &TerminalPrefs) -> Box<dyn TerminalEmulator> {
        Box::new(StdoutEmulator)
    }
}
