//! Terminal session multiplexer.
//!
//! Any number of remote terminals share one peer. Every outbound frame is
//! tagged with its session id and every inbound output frame is written to
//! the emulator of the session it names, and nowhere else.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::events::{ClientEvent, EventBus};
use crate::peer::PeerSlot;
use crate::protocol::{Command, Envelope, StreamKind};
use crate::session::{
    validate_session_id, EmulatorFactory, SessionState, TerminalPrefs, TerminalSession,
    TerminalSize,
};

pub const DEFAULT_RESIZE_DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MuxError {
    #[error("invalid session id: {0}")]
    InvalidSession(String),
    #[error("no such session: {0}")]
    NotFound(String),
    #[error("no live peer")]
    NotConnected,
}

/// Snapshot of one session for listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub display_name: String,
    pub state: SessionState,
    pub size: Option<TerminalSize>,
}

#[derive(Default)]
struct MuxInner {
    sessions: HashMap<String, TerminalSession>,
    focused: Option<String>,
    prefs: TerminalPrefs,
    resizes: HashMap<String, JoinHandle<()>>,
}

pub struct Multiplexer {
    connection_id: String,
    peer: PeerSlot,
    factory: Arc<dyn EmulatorFactory>,
    events: EventBus,
    debounce: Duration,
    inner: Arc<Mutex<MuxInner>>,
}

impl Multiplexer {
    pub fn new(
        connection_id: &str,
        peer: PeerSlot,
        factory: Arc<dyn EmulatorFactory>,
        events: EventBus,
        debounce: Duration,
    ) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            peer,
            factory,
            events,
            debounce,
            inner: Arc::new(Mutex::new(MuxInner::default())),
        }
    }

    /// Open a session, or focus it if it is already open.
    ///
    /// Only the first open sends `startTerminal`; later calls reuse the
    /// existing emulator.
    pub fn open(&self, session_id: &str, display_name: &str) -> Result<SessionState, MuxError> {
        validate_session_id(session_id).map_err(MuxError::InvalidSession)?;

        let created = {
            let mut inner = self.inner.lock();
            if inner.sessions.contains_key(session_id) {
                false
            } else {
                if !self.peer.send(&Command::start_terminal(session_id)) {
                    return Err(MuxError::NotConnected);
                }
                let emulator = self.factory.create(session_id, display_name, &inner.prefs);
                inner.sessions.insert(
                    session_id.to_string(),
                    TerminalSession::new(session_id, display_name, emulator),
                );
                true
            }
        };
        if created {
            tracing::info!(connection = %self.connection_id, session = %session_id, "terminal opened");
            self.publish_changes(vec![(session_id.to_string(), SessionState::Opening)]);
        }

        self.switch_to(session_id)?;
        self.state(session_id)
            .ok_or_else(|| MuxError::NotFound(session_id.to_string()))
    }

    /// Make `session_id` the one visible session; every other goes to the
    /// background. Visibility changes geometry, so the new focus is refitted.
    pub fn switch_to(&self, session_id: &str) -> Result<(), MuxError> {
        let mut changes = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !inner.sessions.contains_key(session_id) {
                return Err(MuxError::NotFound(session_id.to_string()));
            }
            for (id, session) in inner.sessions.iter_mut() {
                let before = session.state();
                session.set_visible(id == session_id);
                if session.state() != before {
                    changes.push((id.clone(), session.state()));
                }
            }
            inner.focused = Some(session_id.to_string());
            let prefs = inner.prefs.clone();
            let measured = inner
                .sessions
                .get(session_id)
                .and_then(|s| s.measure(&prefs));
            if let Some(size) = measured {
                self.schedule_resize(&mut inner, session_id, size, false);
            }
        }
        self.publish_changes(changes);
        Ok(())
    }

    /// Explicit geometry from the rendering layer (its `onResize`).
    pub fn resize(&self, session_id: &str, size: TerminalSize) -> Result<(), MuxError> {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(session_id) {
            return Err(MuxError::NotFound(session_id.to_string()));
        }
        if size.is_renderable() {
            self.schedule_resize(&mut inner, session_id, size, false);
        }
        Ok(())
    }

    /// Re-measure every session and send any geometry that changed.
    pub fn refit(&self) {
        let mut inner = self.inner.lock();
        let prefs = inner.prefs.clone();
        let measured: Vec<(String, TerminalSize)> = inner
            .sessions
            .iter()
            .filter_map(|(id, s)| s.measure(&prefs).map(|size| (id.clone(), size)))
            .collect();
        for (id, size) in measured {
            self.schedule_resize(&mut inner, &id, size, false);
        }
    }

    /// Change font size/theme for every session. Cell geometry depends on
    /// font size, so every open session re-sends its size.
    pub fn set_prefs(&self, prefs: TerminalPrefs) {
        let mut inner = self.inner.lock();
        inner.prefs = prefs.clone();
        let mut resends = Vec::new();
        for (id, session) in inner.sessions.iter_mut() {
            session.apply_prefs(&prefs);
            if let Some(size) = session.measure(&prefs).or(session.sent_size) {
                resends.push((id.clone(), size));
            }
        }
        for (id, size) in resends {
            self.schedule_resize(&mut inner, &id, size, true);
        }
    }

    pub fn prefs(&self) -> TerminalPrefs {
        self.inner.lock().prefs.clone()
    }

    /// Forward local keystrokes. Always base64 on the wire.
    pub fn input(&self, session_id: &str, data: &[u8]) -> Result<(), MuxError> {
        if !self.inner.lock().sessions.contains_key(session_id) {
            return Err(MuxError::NotFound(session_id.to_string()));
        }
        if self.peer.send(&Command::terminal_input(session_id, data)) {
            Ok(())
        } else {
            Err(MuxError::NotConnected)
        }
    }

    /// Write an inbound output frame to its session's emulator.
    ///
    /// Frames for unknown sessions and undecodable payloads are dropped.
    pub fn handle_output(&self, kind: StreamKind, envelope: &Envelope) {
        let Some(session_id) = envelope.container_id.as_deref() else {
            tracing::debug!(connection = %self.connection_id, ?kind, "output frame without session id");
            return;
        };
        let bytes = match envelope.payload_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(connection = %self.connection_id, session = %session_id, error = %e, "dropping undecodable output");
                return;
            }
        };

        let acknowledged = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.sessions.get_mut(session_id) else {
                tracing::debug!(connection = %self.connection_id, session = %session_id, "output for unknown session");
                return;
            };
            session.write_output(&bytes).then(|| session.state())
        };

        if let Some(state) = acknowledged {
            self.publish_changes(vec![(session_id.to_string(), state)]);
        }
    }

    /// Ask the host to end the session, then clean up locally whether or
    /// not the request got out. Returns false for an unknown session.
    pub fn kill(&self, session_id: &str) -> bool {
        if !self.inner.lock().sessions.contains_key(session_id) {
            return false;
        }
        if !self.peer.send(&Command::kill_terminal(session_id)) {
            tracing::debug!(connection = %self.connection_id, session = %session_id, "killTerminal not sent, cleaning up locally");
        }
        self.close_local(session_id);
        true
    }

    /// Close every session without contacting the host.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.inner.lock().sessions.keys().cloned().collect();
        for id in ids {
            self.close_local(&id);
        }
    }

    fn close_local(&self, session_id: &str) {
        let removed = {
            let mut inner = self.inner.lock();
            if let Some(handle) = inner.resizes.remove(session_id) {
                handle.abort();
            }
            if inner.focused.as_deref() == Some(session_id) {
                inner.focused = None;
            }
            inner.sessions.remove(session_id)
        };
        if let Some(mut session) = removed {
            session.close();
            tracing::info!(connection = %self.connection_id, session = %session_id, "terminal closed");
            self.publish_changes(vec![(session_id.to_string(), SessionState::Closed)]);
        }
    }

    pub fn state(&self, session_id: &str) -> Option<SessionState> {
        self.inner.lock().sessions.get(session_id).map(|s| s.state())
    }

    pub fn focused(&self) -> Option<String> {
        self.inner.lock().focused.clone()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock();
        let mut list: Vec<SessionInfo> = inner
            .sessions
            .values()
            .map(|s| SessionInfo {
                session_id: s.session_id.clone(),
                display_name: s.display_name.clone(),
                state: s.state(),
                size: s.sent_size,
            })
            .collect();
        list.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        list
    }

    pub fn selection(&self, session_id: &str) -> Option<String> {
        self.inner.lock().sessions.get(session_id)?.selection()
    }

    pub fn clear(&self, session_id: &str) -> Result<(), MuxError> {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| MuxError::NotFound(session_id.to_string()))?;
        session.clear();
        Ok(())
    }

    /// Replace any queued resize for the session with one that fires after
    /// the debounce window. Unless `force`, a size equal to the one already
    /// sent is not re-sent.
    fn schedule_resize(&self, inner: &mut MuxInner, session_id: &str, size: TerminalSize, force: bool) {
        if let Some(handle) = inner.resizes.remove(session_id) {
            handle.abort();
        }
        let sent = inner.sessions.get(session_id).and_then(|s| s.sent_size);
        if !force && sent == Some(size) {
            return;
        }

        let peer = self.peer.clone();
        let shared = self.inner.clone();
        let debounce = self.debounce;
        let id = session_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if !peer.send(&Command::terminal_resize(&id, size.cols, size.rows)) {
                return;
            }
            if let Some(session) = shared.lock().sessions.get_mut(&id) {
                session.sent_size = Some(size);
            }
        });
        inner.resizes.insert(session_id.to_string(), handle);
    }

    fn publish_changes(&self, changes: Vec<(String, SessionState)>) {
        for (session_id, state) in changes {
            self.events.publish(ClientEvent::SessionChanged {
                connection_id: self.connection_id.clone(),
                session_id,
                state,
            });
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        for (_, handle) in self.inner.lock().resizes.drain() {
            handle.abort();
        }
    }
}
