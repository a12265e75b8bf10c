use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;

const MAX_SESSION_ID_LEN: usize = 128;

/// Validate a session id. Ids are remote container/exec ids and must be
/// 1-128 chars, alphanumeric/hyphens/underscores/dots.
pub fn validate_session_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("session id must not be empty".into());
    }
    if id.len() > MAX_SESSION_ID_LEN {
        return Err(format!(
            "session id too long ({} chars, max {MAX_SESSION_ID_LEN})",
            id.len()
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(format!(
            "session id contains invalid characters: {}",
            id.chars().take(64).collect::<String>()
        ));
    }
    Ok(())
}

/// Lifecycle of a multiplexed terminal session.
///
/// `Opening` until the host streams its first output, then `Active` while
/// focused and `Background` otherwise. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Opening,
    Active,
    Background,
    Closed,
}

/// Geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Zero-sized geometry means the surface is hidden or not laid out yet.
    pub fn is_renderable(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Multiplexer-wide presentation preferences.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalPrefs {
    pub font_size: u16,
    pub theme: String,
}

impl Default for TerminalPrefs {
    fn default() -> Self {
        Self {
            font_size: 14,
            theme: "dark".to_string(),
        }
    }
}

/// The rendering side of a terminal. Owns scrollback; the core only feeds it
/// bytes and asks it how many cells fit.
pub trait TerminalEmulator: Send {
    fn write(&mut self, bytes: &[u8]);

    fn clear(&mut self);

    /// Current geometry under `prefs`, or `None` if the surface cannot be
    /// measured (hidden, detached).
    fn measure(&self, prefs: &TerminalPrefs) -> Option<TerminalSize>;

    fn apply_prefs(&mut self, _prefs: &TerminalPrefs) {}

    fn set_visible(&mut self, _visible: bool) {}

    fn selection(&self) -> Option<String> {
        None
    }

    fn dispose(&mut self);
}

/// Creates one emulator per opened session.
pub trait EmulatorFactory: Send + Sync {
    fn create(
        &self,
        session_id: &str,
        display_name: &str,
        prefs: &TerminalPrefs,
    ) -> Box<dyn TerminalEmulator>;
}

/// Discards everything. For connections nobody renders.
pub struct NullEmulatorFactory;

struct NullEmulator;

impl TerminalEmulator for NullEmulator {
    fn write(&mut self, _bytes: &[u8]) {}
    fn clear(&mut self) {}
    fn measure(&self, _prefs: &TerminalPrefs) -> Option<TerminalSize> {
        None
    }
    fn dispose(&mut self) {}
}

impl EmulatorFactory for NullEmulatorFactory {
    fn create(&self, _: &str, _: &str, _: &TerminalPrefs) -> Box<dyn TerminalEmulator> {
        Box::new(NullEmulator)
    }
}

/// Everything a [`CaptureEmulatorFactory`] recorded for one session.
#[derive(Debug, Clone, Default)]
pub struct Capture {
    pub output: Vec<u8>,
    pub visible: bool,
    pub disposed: bool,
    pub prefs: Option<TerminalPrefs>,
}

impl Capture {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Headless emulators that keep every byte written to them.
///
/// Measured geometry is shared by all sessions and set with
/// [`CaptureEmulatorFactory::set_geometry`], so a caller can simulate the
/// rendering surface being laid out again.
#[derive(Clone, Default)]
pub struct CaptureEmulatorFactory {
    captures: Arc<Mutex<HashMap<String, Capture>>>,
    geometry: Arc<Mutex<Option<TerminalSize>>>,
    created: Arc<Mutex<usize>>,
}

impl CaptureEmulatorFactory {
    pub fn new(geometry: TerminalSize) -> Self {
        let factory = Self::default();
        *factory.geometry.lock() = Some(geometry);
        factory
    }

    pub fn set_geometry(&self, geometry: Option<TerminalSize>) {
        *self.geometry.lock() = geometry;
    }

    pub fn capture(&self, session_id: &str) -> Option<Capture> {
        self.captures.lock().get(session_id).cloned()
    }

    /// Number of emulators created over the factory's lifetime.
    pub fn created(&self) -> usize {
        *self.created.lock()
    }
}

impl EmulatorFactory for CaptureEmulatorFactory {
    fn create(
        &self,
        session_id: &str,
        _display_name: &str,
        prefs: &TerminalPrefs,
    ) -> Box<dyn TerminalEmulator> {
        *self.created.lock() += 1;
        self.captures.lock().insert(
            session_id.to_string(),
            Capture {
                prefs: Some(prefs.clone()),
                ..Default::default()
            },
        );
        Box::new(CaptureEmulator {
            session_id: session_id.to_string(),
            captures: self.captures.clone(),
            geometry: self.geometry.clone(),
        })
    }
}

struct CaptureEmulator {
    session_id: String,
    captures: Arc<Mutex<HashMap<String, Capture>>>,
    geometry: Arc<Mutex<Option<TerminalSize>>>,
}

impl CaptureEmulator {
    fn with<R>(&self, f: impl FnOnce(&mut Capture) -> R) -> Option<R> {
        self.captures.lock().get_mut(&self.session_id).map(f)
    }
}

impl TerminalEmulator for CaptureEmulator {
    fn write(&mut self, bytes: &[u8]) {
        self.with(|c| c.output.extend_from_slice(bytes));
    }

    fn clear(&mut self) {
        self.with(|c| c.output.clear());
    }

    fn measure(&self, _prefs: &TerminalPrefs) -> Option<TerminalSize> {
        *self.geometry.lock()
    }

    fn apply_prefs(&mut self, prefs: &TerminalPrefs) {
        self.with(|c| c.prefs = Some(prefs.clone()));
    }

    fn set_visible(&mut self, visible: bool) {
        self.with(|c| c.visible = visible);
    }

    fn selection(&self) -> Option<String> {
        self.with(|c| c.text()).filter(|s| !s.is_empty())
    }

    fn dispose(&mut self) {
        self.with(|c| c.disposed = true);
    }
}

/// One logical PTY multiplexed over a Connection's peer.
pub struct TerminalSession {
    pub session_id: String,
    pub display_name: String,
    pub opened_at: SystemTime,
    /// Geometry last sent to the host.
    pub(crate) sent_size: Option<TerminalSize>,
    acknowledged: bool,
    visible: bool,
    closed: bool,
    emulator: Box<dyn TerminalEmulator>,
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("session_id", &self.session_id)
            .field("display_name", &self.display_name)
            .field("state", &self.state())
            .field("sent_size", &self.sent_size)
            .finish_non_exhaustive()
    }
}

impl TerminalSession {
    pub fn new(session_id: &str, display_name: &str, emulator: Box<dyn TerminalEmulator>) -> Self {
        Self {
            session_id: session_id.to_string(),
            display_name: display_name.to_string(),
            opened_at: SystemTime::now(),
            sent_size: None,
            acknowledged: false,
            visible: false,
            closed: false,
            emulator,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else if !self.acknowledged {
            SessionState::Opening
        } else if self.visible {
            SessionState::Active
        } else {
            SessionState::Background
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub(crate) fn set_visible(&mut self, visible: bool) {
        if self.visible != visible {
            self.visible = visible;
            self.emulator.set_visible(visible);
        }
    }

    /// Write host output. The first write acknowledges the session.
    /// Returns true if this call moved the session out of `Opening`.
    pub(crate) fn write_output(&mut self, bytes: &[u8]) -> bool {
        if self.closed {
            return false;
        }
        self.emulator.write(bytes);
        let first = !self.acknowledged;
        self.acknowledged = true;
        first
    }

    pub(crate) fn measure(&self, prefs: &TerminalPrefs) -> Option<TerminalSize> {
        self.emulator
            .measure(prefs)
            .filter(TerminalSize::is_renderable)
    }

    pub(crate) fn apply_prefs(&mut self, prefs: &TerminalPrefs) {
        self.emulator.apply_prefs(prefs);
    }

    pub fn selection(&self) -> Option<String> {
        self.emulator.selection()
    }

    pub(crate) fn clear(&mut self) {
        self.emulator.clear();
    }

    /// Dispose the emulator. Idempotent.
    pub(crate) fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.visible = false;
            self.emulator.dispose();
        }
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.close();
    }
}
