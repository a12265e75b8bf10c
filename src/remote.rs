//! Everything scoped to one Connection.
//!
//! A [`Remote`] wires a peer slot, correlator, multiplexer, stats aggregator
//! and listing cache together behind one [`Router`]. Connections never share
//! any of these, so work on one cannot stall or corrupt another.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::correlator::{CommandOptions, Correlator, Expect, Response, LONG_TIMEOUT, SHORT_TIMEOUT};
use crate::error::CommandError;
use crate::events::EventBus;
use crate::listing::ListingStore;
use crate::mux::{Multiplexer, DEFAULT_RESIZE_DEBOUNCE};
use crate::peer::{PeerConnection, PeerSlot};
use crate::protocol::Command;
use crate::router::Router;
use crate::session::EmulatorFactory;
use crate::stats::{StatsAggregator, DEFAULT_ALPHA, DEFAULT_CAPACITY};
use crate::transport::PeerLink;

/// Per-Connection tunables.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub short_timeout: Duration,
    pub long_timeout: Duration,
    pub resize_debounce: Duration,
    pub stats_alpha: f64,
    pub stats_capacity: usize,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            short_timeout: SHORT_TIMEOUT,
            long_timeout: LONG_TIMEOUT,
            resize_debounce: DEFAULT_RESIZE_DEBOUNCE,
            stats_alpha: DEFAULT_ALPHA,
            stats_capacity: DEFAULT_CAPACITY,
        }
    }
}

pub struct Remote {
    connection_id: String,
    settings: RemoteSettings,
    peer: PeerSlot,
    correlator: Arc<Correlator>,
    mux: Arc<Multiplexer>,
    stats: Arc<StatsAggregator>,
    listings: Arc<ListingStore>,
    router: Arc<Router>,
    events: EventBus,
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("connection_id", &self.connection_id)
            .field("connected", &self.peer.is_connected())
            .finish_non_exhaustive()
    }
}

impl Remote {
    pub fn new(
        connection_id: &str,
        settings: RemoteSettings,
        factory: Arc<dyn EmulatorFactory>,
        events: EventBus,
    ) -> Arc<Self> {
        let peer = PeerSlot::new();
        let correlator = Arc::new(Correlator::new(connection_id, peer.clone()));
        let mux = Arc::new(Multiplexer::new(
            connection_id,
            peer.clone(),
            factory,
            events.clone(),
            settings.resize_debounce,
        ));
        let stats = Arc::new(StatsAggregator::new(
            settings.stats_alpha,
            settings.stats_capacity,
        ));
        let listings = Arc::new(ListingStore::new());
        let router = Arc::new(Router::new(
            connection_id,
            correlator.clone(),
            mux.clone(),
            stats.clone(),
            listings.clone(),
            events.clone(),
        ));

        Arc::new(Self {
            connection_id: connection_id.to_string(),
            settings,
            peer,
            correlator,
            mux,
            stats,
            listings,
            router,
            events,
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn settings(&self) -> &RemoteSettings {
        &self.settings
    }

    pub fn peer(&self) -> PeerSlot {
        self.peer.clone()
    }

    pub fn correlator(&self) -> Arc<Correlator> {
        self.correlator.clone()
    }

    pub fn mux(&self) -> Arc<Multiplexer> {
        self.mux.clone()
    }

    pub fn stats(&self) -> Arc<StatsAggregator> {
        self.stats.clone()
    }

    pub fn listings(&self) -> Arc<ListingStore> {
        self.listings.clone()
    }

    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_connected()
    }

    /// Adopt a newly discovered link as this Connection's peer.
    ///
    /// First wins: if a live peer is already installed the link is closed
    /// and `None` is returned, leaving the existing peer untouched.
    pub fn attach(&self, link: PeerLink) -> Option<Arc<PeerConnection>> {
        if self.peer.is_connected() {
            tracing::info!(connection = %self.connection_id, peer = %link.remote_id, "duplicate peer rejected");
            link.close();
            return None;
        }
        let peer = PeerConnection::spawn(link, self.router.clone());
        match self.peer.install(peer.clone()) {
            Ok(()) => Some(peer),
            Err(rejected) => {
                tracing::info!(connection = %self.connection_id, peer = %rejected.remote_id(), "duplicate peer rejected");
                rejected.close();
                None
            }
        }
    }

    /// React to `peer` closing. Pending requests fail with a transport error
    /// and terminals are closed locally; cached listings and stats stay until
    /// an explicit disconnect. Returns false if `peer` was no longer current.
    pub fn handle_peer_lost(&self, peer: &Arc<PeerConnection>) -> bool {
        if !self.peer.clear_if(peer) {
            return false;
        }
        tracing::info!(connection = %self.connection_id, peer = %peer.remote_id(), "peer lost");
        self.correlator
            .reject_all(CommandError::Transport("peer closed".into()));
        self.mux.close_all();
        true
    }

    /// Drop the peer and every piece of Connection-scoped state.
    pub fn teardown(&self) {
        if let Some(peer) = self.peer.take() {
            peer.close();
        }
        self.correlator
            .reject_all(CommandError::Transport("disconnected".into()));
        self.mux.close_all();
        self.listings.clear();
        self.stats.clear();
    }

    /// Fire-and-forget send. False when there is no live peer.
    pub fn send(&self, command: &Command) -> bool {
        self.peer.send(command)
    }

    /// [`Correlator::execute`] with this Connection's short timeout.
    pub async fn execute_short<A: Serialize>(
        &self,
        command: &str,
        args: A,
        expect: Expect,
    ) -> Result<Response, CommandError> {
        let opts = CommandOptions::new(expect, self.settings.short_timeout);
        self.correlator.execute(command, args, opts).await
    }

    /// [`Correlator::execute`] with this Connection's long timeout.
    pub async fn execute_long<A: Serialize>(
        &self,
        command: &str,
        args: A,
        expect: Expect,
    ) -> Result<Response, CommandError> {
        let opts = CommandOptions::new(expect, self.settings.long_timeout);
        self.correlator.execute(command, args, opts).await
    }
}
