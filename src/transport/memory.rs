//! In-process transport.
//!
//! A [`MemoryDiscovery`] lets the host side of a test (or an embedding
//! application that runs both ends in one process) announce peers on a
//! topic. Each announcement hands back a [`RemoteEnd`] for scripting the
//! host's half of the conversation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Discovery, PeerLink};
use crate::protocol::{Command, Envelope};

#[derive(Clone, Default)]
pub struct MemoryDiscovery {
    joined: Arc<Mutex<HashMap<String, mpsc::Sender<PeerLink>>>>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a client currently listens on `topic`.
    pub fn is_joined(&self, topic: &str) -> bool {
        self.joined
            .lock()
            .get(topic)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Announce a new host peer on `topic`.
    ///
    /// Returns `None` when no client has joined the topic.
    pub async fn announce(&self, topic: &str) -> Option<RemoteEnd> {
        let peer_tx = self.joined.lock().get(topic).cloned()?;
        let (local, remote) = PeerLink::pair(topic);
        peer_tx.send(local).await.ok()?;
        Some(RemoteEnd { link: remote })
    }
}

impl Discovery for MemoryDiscovery {
    fn join(&self, topic: &str) -> mpsc::Receiver<PeerLink> {
        let (tx, rx) = mpsc::channel(4);
        self.joined.lock().insert(topic.to_string(), tx);
        rx
    }

    fn leave(&self, topic: &str) {
        self.joined.lock().remove(topic);
    }
}

/// The host's end of an in-memory link.
pub struct RemoteEnd {
    link: PeerLink,
}

impl RemoteEnd {
    /// Send an envelope to the client. Returns false once the link is gone.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        match envelope.encode() {
            Ok(frame) => self.send_raw(frame).await,
            Err(_) => false,
        }
    }

    /// Send an arbitrary frame, valid or not.
    pub async fn send_raw(&self, frame: impl Into<Bytes>) -> bool {
        self.link.outbound.send(frame.into()).await.is_ok()
    }

    /// Next command from the client, or `None` if the link closed.
    /// Frames that are not valid commands are skipped.
    pub async fn recv_command(&mut self) -> Option<Command> {
        loop {
            tokio::select! {
                frame = self.link.inbound.recv() => {
                    let frame = frame?;
                    match Command::decode(&frame) {
                        Ok(cmd) => return Some(cmd),
                        Err(e) => tracing::debug!(error = %e, "host end skipped undecodable frame"),
                    }
                }
                _ = self.link.closed.cancelled() => return None,
            }
        }
    }

    /// Like [`RemoteEnd::recv_command`] with a deadline.
    pub async fn recv_command_within(&mut self, wait: Duration) -> Option<Command> {
        tokio::time::timeout(wait, self.recv_command())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the next command named `name`, discarding others.
    pub async fn expect_command(&mut self, name: &str, wait: Duration) -> Option<Command> {
        tokio::time::timeout(wait, async {
            loop {
                let cmd = self.recv_command().await?;
                if cmd.command == name {
                    return Some(cmd);
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    pub fn close(&self) {
        self.link.close();
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }
}
