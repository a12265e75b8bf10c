//! Peer-to-peer transport abstraction.
//!
//! Discovery, NAT traversal and encryption belong to whatever network layer
//! sits behind a [`Discovery`]. The core only needs two things from it: a
//! stream of peers for a topic, and a message-oriented duplex link per peer.

pub mod memory;
pub mod ws;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of each direction of a [`PeerLink`].
pub const LINK_CAPACITY: usize = 256;

/// Topic-keyed peer discovery in the client-only role (join, never announce).
pub trait Discovery: Send + Sync + 'static {
    /// Start listening for peers on `topic`. Every peer found while joined is
    /// delivered on the returned channel, including silent re-connections.
    fn join(&self, topic: &str) -> mpsc::Receiver<PeerLink>;

    /// Stop listening on `topic` and drop any link still being dialed.
    fn leave(&self, topic: &str);
}

/// One end of a duplex, message-oriented link to a peer.
///
/// `outbound` carries frames towards the other end, `inbound` yields frames
/// sent by it. Either side cancels `closed` to tear the link down.
#[derive(Debug)]
pub struct PeerLink {
    pub remote_id: String,
    pub outbound: mpsc::Sender<Bytes>,
    pub inbound: mpsc::Receiver<Bytes>,
    pub closed: CancellationToken,
}

impl PeerLink {
    /// Create both ends of a link. Frames sent on one end arrive on the other.
    pub fn pair(remote_id: &str) -> (PeerLink, PeerLink) {
        let (a_tx, a_rx) = mpsc::channel(LINK_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(LINK_CAPACITY);
        let closed = CancellationToken::new();
        let local = PeerLink {
            remote_id: remote_id.to_string(),
            outbound: a_tx,
            inbound: b_rx,
            closed: closed.clone(),
        };
        let remote = PeerLink {
            remote_id: remote_id.to_string(),
            outbound: b_tx,
            inbound: a_rx,
            closed,
        };
        (local, remote)
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outbound.is_closed()
    }
}
