//! Event surface for rendering layers.
//!
//! The core never touches a UI. Everything a view might want to redraw is
//! published here, tagged with the Connection it concerns.

use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::error::RemoteErrorKind;
use crate::registry::Health;
use crate::session::SessionState;

pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectionAdded {
        connection_id: String,
    },
    Connected {
        connection_id: String,
    },
    Disconnected {
        connection_id: String,
    },
    Removed {
        connection_id: String,
    },
    ActiveChanged {
        connection_id: Option<String>,
    },
    HealthChanged {
        connection_id: String,
        health: Health,
        latency_ms: Option<u64>,
    },
    /// A cached listing (containers, images, ...) was replaced.
    Listing {
        connection_id: String,
        kind: String,
    },
    /// A typed broadcast with no dedicated handler.
    Broadcast {
        connection_id: String,
        kind: String,
        data: Value,
    },
    StatsUpdated {
        connection_id: String,
        subject_id: String,
    },
    SessionChanged {
        connection_id: String,
        session_id: String,
        state: SessionState,
    },
    /// The host reported an error on an inbound frame.
    RemoteError {
        connection_id: String,
        kind: RemoteErrorKind,
        message: String,
    },
}

impl ClientEvent {
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            ClientEvent::ActiveChanged { connection_id } => connection_id.as_deref(),
            ClientEvent::ConnectionAdded { connection_id }
            | ClientEvent::Connected { connection_id }
            | ClientEvent::Disconnected { connection_id }
            | ClientEvent::Removed { connection_id }
            | ClientEvent::HealthChanged { connection_id, .. }
            | ClientEvent::Listing { connection_id, .. }
            | ClientEvent::Broadcast { connection_id, .. }
            | ClientEvent::StatsUpdated { connection_id, .. }
            | ClientEvent::SessionChanged { connection_id, .. }
            | ClientEvent::RemoteError { connection_id, .. } => Some(connection_id),
        }
    }
}

/// Wrapper for event stream items that includes lag notifications.
#[derive(Debug, Clone)]
pub enum EventItem {
    Event(ClientEvent),
    /// The subscriber fell behind and `n` events were dropped.
    Lagged(u64),
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: ClientEvent) {
        // Ignore error - means no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as an async `Stream`, surfacing lag instead of hiding it.
    pub fn stream(&self) -> impl Stream<Item = EventItem> {
        BroadcastStream::new(self.tx.subscribe()).map(|result| match result {
            Ok(event) => EventItem::Event(event),
            Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => {
                EventItem::Lagged(n)
            }
        })
    }
}
