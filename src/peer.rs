use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{self, Command};
use crate::router::Router;
use crate::transport::PeerLink;

/// One live duplex stream to a remote host.
///
/// Spawns a reader task that decodes every inbound frame and hands it to the
/// connection's [`Router`] in arrival order, and a writer task that feeds
/// queued frames into the link as it drains. Both end when the link closes
/// from either side; [`PeerConnection::closed`] resolves at that point.
pub struct PeerConnection {
    remote_id: String,
    queue: mpsc::UnboundedSender<Bytes>,
    closed: CancellationToken,
    connected_at: SystemTime,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("remote_id", &self.remote_id)
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

impl PeerConnection {
    /// Take ownership of `link` and start dispatching its inbound frames.
    pub fn spawn(link: PeerLink, router: Arc<Router>) -> Arc<Self> {
        let PeerLink {
            remote_id,
            outbound,
            inbound,
            closed,
        } = link;
        let (queue, queued) = mpsc::unbounded_channel();

        let peer = Arc::new(Self {
            remote_id,
            queue,
            closed: closed.clone(),
            connected_at: SystemTime::now(),
        });

        tokio::spawn(write_loop(queued, outbound, closed.clone()));
        tokio::spawn(read_loop(inbound, closed, router));
        peer
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    pub fn is_live(&self) -> bool {
        !self.closed.is_cancelled() && !self.queue.is_closed()
    }

    /// Serialize and queue a command.
    ///
    /// Frames for a live peer are never dropped: they wait in send order
    /// until the link has room. Only a dead peer (or an unencodable command)
    /// drops the frame, logs, and returns `false`.
    pub fn send(&self, cmd: &Command) -> bool {
        if !self.is_live() {
            tracing::debug!(peer = %self.remote_id, command = %cmd.command, "peer closed, dropping command");
            return false;
        }
        let frame = match cmd.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(command = %cmd.command, error = %e, "failed to encode command");
                return false;
            }
        };
        if self.queue.send(frame).is_err() {
            tracing::debug!(peer = %self.remote_id, "peer writer gone");
            self.closed.cancel();
            return false;
        }
        true
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves once the link has closed, from either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

async fn write_loop(
    mut queued: mpsc::UnboundedReceiver<Bytes>,
    outbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            frame = queued.recv() => {
                let Some(frame) = frame else { break };
                tokio::select! {
                    sent = outbound.send(frame) => {
                        if sent.is_err() {
                            tracing::debug!("peer link closed under writer");
                            break;
                        }
                    }
                    _ = closed.cancelled() => break,
                }
            }
            _ = closed.cancelled() => break,
        }
    }
    closed.cancel();
}

async fn read_loop(
    mut inbound: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
    router: Arc<Router>,
) {
    loop {
        tokio::select! {
            frame = inbound.recv() => {
                let Some(frame) = frame else { break };
                match protocol::decode(&frame) {
                    Ok(envelope) => router.route(envelope),
                    Err(e) => {
                        // Streaming frames are fire-and-forget; never tear down
                        // the connection over one bad frame.
                        tracing::warn!(connection = %router.connection_id(), error = %e, "dropping undecodable frame");
                    }
                }
            }
            _ = closed.cancelled() => break,
        }
    }
    closed.cancel();
}

/// Holder of a Connection's single live peer.
///
/// Components that need to write (correlator, multiplexer, health probe)
/// receive a clone of the slot rather than reaching for a global.
#[derive(Clone, Default)]
pub struct PeerSlot {
    inner: Arc<RwLock<Option<Arc<PeerConnection>>>>,
}

impl PeerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<PeerConnection>> {
        self.inner.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.read().as_ref().is_some_and(|p| p.is_live())
    }

    /// Install `peer` unless a live one is already present (first wins).
    /// A dead occupant is replaced.
    pub fn install(&self, peer: Arc<PeerConnection>) -> Result<(), Arc<PeerConnection>> {
        let mut slot = self.inner.write();
        if slot.as_ref().is_some_and(|p| p.is_live()) {
            return Err(peer);
        }
        *slot = Some(peer);
        Ok(())
    }

    /// Empty the slot if it still holds `peer`. Returns true if it did.
    pub fn clear_if(&self, peer: &Arc<PeerConnection>) -> bool {
        let mut slot = self.inner.write();
        if slot.as_ref().is_some_and(|p| Arc::ptr_eq(p, peer)) {
            *slot = None;
            return true;
        }
        false
    }

    pub fn take(&self) -> Option<Arc<PeerConnection>> {
        self.inner.write().take()
    }

    /// Send through the current peer; `false` when there is none.
    pub fn send(&self, cmd: &Command) -> bool {
        match self.get() {
            Some(peer) => peer.send(cmd),
            None => {
                tracing::debug!(command = %cmd.command, "no active peer, dropping command");
                false
            }
        }
    }
}
