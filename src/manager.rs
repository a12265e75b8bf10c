use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::correlator::{CommandOptions, Response};
use crate::error::CommandError;
use crate::events::{ClientEvent, EventBus, EventItem};
use crate::peer::PeerConnection;
use crate::protocol::{BroadcastKind, Command};
use crate::registry::{
    classify_latency, ConnectionEntry, ConnectionRegistry, Health, RegistryError,
};
use crate::remote::{Remote, RemoteSettings};
use crate::session::{EmulatorFactory, NullEmulatorFactory};
use crate::store::{Bookmark, BookmarkStore, StoreError};
use crate::transport::{Discovery, PeerLink};

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub probe_interval: Duration,
    pub slow_threshold: Duration,
    pub probe_timeout: Duration,
    pub remote: RemoteSettings,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            slow_threshold: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(10),
            remote: RemoteSettings::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("connection not found: {0}")]
    NotFound(String),
    #[error("connection {0} has no live peer")]
    NotConnected(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of one health probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub health: Health,
    pub latency_ms: Option<u64>,
}

struct ConnectionHandle {
    topic_key: String,
    remote: Arc<Remote>,
    cancel: CancellationToken,
}

struct Shared {
    discovery: Arc<dyn Discovery>,
    registry: ConnectionRegistry,
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    events: EventBus,
    settings: ManagerSettings,
    factory: Arc<dyn EmulatorFactory>,
    bookmarks: Option<BookmarkStore>,
}

pub struct ManagerBuilder {
    discovery: Arc<dyn Discovery>,
    settings: ManagerSettings,
    factory: Arc<dyn EmulatorFactory>,
    bookmarks: Option<BookmarkStore>,
}

impl ManagerBuilder {
    pub fn settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn emulators(mut self, factory: Arc<dyn EmulatorFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn bookmarks(mut self, store: BookmarkStore) -> Self {
        self.bookmarks = Some(store);
        self
    }

    pub fn build(self) -> ConnectionManager {
        ConnectionManager {
            shared: Arc::new(Shared {
                discovery: self.discovery,
                registry: ConnectionRegistry::new(),
                connections: RwLock::new(HashMap::new()),
                events: EventBus::new(),
                settings: self.settings,
                factory: self.factory,
                bookmarks: self.bookmarks,
            }),
        }
    }
}

/// Owns every Connection: its registry record, its [`Remote`], the task
/// listening for peers on its topic and, while a peer is live, the task
/// probing its health.
///
/// Cloning is cheap and shares the same state. Background tasks hold only a
/// weak reference, so dropping the last clone stops them.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn builder(discovery: Arc<dyn Discovery>) -> ManagerBuilder {
        ManagerBuilder {
            discovery,
            settings: ManagerSettings::default(),
            factory: Arc::new(NullEmulatorFactory),
            bookmarks: None,
        }
    }

    pub fn new(discovery: Arc<dyn Discovery>) -> Self {
        Self::builder(discovery).build()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    pub fn event_stream(&self) -> impl Stream<Item = EventItem> {
        self.shared.events.stream()
    }

    /// Register a Connection and start listening for its peer. Returns at
    /// once; the peer arrives asynchronously.
    pub fn add_connection(&self, topic_key: &str, alias: Option<&str>) -> Result<String, ManagerError> {
        let id = self.shared.register(topic_key, alias)?;
        self.shared.persist();
        Ok(id)
    }

    /// Tear down the peer, leave the topic and forget the Connection along
    /// with its sessions, listings and stats.
    pub fn disconnect(&self, id: &str) -> Result<(), ManagerError> {
        let handle = self
            .shared
            .connections
            .write()
            .remove(id)
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;

        handle.cancel.cancel();
        self.shared.discovery.leave(&handle.topic_key);
        handle.remote.teardown();

        let was_active = self.shared.registry.active().as_deref() == Some(id);
        self.shared.registry.remove(id);
        tracing::info!(connection = %id, "connection removed");

        self.shared.publish(ClientEvent::Disconnected {
            connection_id: id.to_string(),
        });
        self.shared.publish(ClientEvent::Removed {
            connection_id: id.to_string(),
        });
        if was_active {
            self.shared.publish(ClientEvent::ActiveChanged { connection_id: None });
        }
        self.shared.persist();
        Ok(())
    }

    /// Route UI commands to `id`. Fails unless it has a live peer; on
    /// success the container listing is refreshed.
    pub fn switch_active(&self, id: &str) -> Result<(), ManagerError> {
        let remote = self
            .remote(id)
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        if !remote.is_connected() {
            return Err(ManagerError::NotConnected(id.to_string()));
        }
        self.shared.registry.set_active(Some(id))?;
        self.shared.publish(ClientEvent::ActiveChanged {
            connection_id: Some(id.to_string()),
        });
        remote.send(&Command::list_containers());
        Ok(())
    }

    pub fn active_id(&self) -> Option<String> {
        self.shared.registry.active()
    }

    pub fn active(&self) -> Option<Arc<Remote>> {
        self.active_id().and_then(|id| self.remote(&id))
    }

    pub fn remote(&self, id: &str) -> Option<Arc<Remote>> {
        self.shared
            .connections
            .read()
            .get(id)
            .map(|h| h.remote.clone())
    }

    pub fn list(&self) -> Vec<ConnectionEntry> {
        self.shared.registry.list()
    }

    pub fn set_alias(&self, id: &str, alias: Option<&str>) -> Result<(), ManagerError> {
        self.shared.registry.set_alias(id, alias)?;
        self.shared.persist();
        Ok(())
    }

    /// Run a command on the active Connection.
    pub async fn execute<A: Serialize>(
        &self,
        command: &str,
        args: A,
        opts: CommandOptions,
    ) -> Result<Response, CommandError> {
        let remote = self
            .active()
            .ok_or_else(|| CommandError::Transport("no active connection".into()))?;
        remote.correlator().execute(command, args, opts).await
    }

    /// Probe `id` once, outside the periodic schedule.
    pub async fn probe(&self, id: &str) -> Result<ProbeOutcome, ManagerError> {
        let remote = self
            .remote(id)
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        let outcome = probe(&remote, &self.shared.settings).await;
        self.shared.record_probe(id, outcome);
        Ok(outcome)
    }

    /// Re-add every saved bookmark. Invalid or duplicate entries are logged
    /// and skipped. Returns the ids added.
    pub fn restore(&self) -> Result<Vec<String>, ManagerError> {
        let Some(ref store) = self.shared.bookmarks else {
            return Ok(Vec::new());
        };
        let mut added = Vec::new();
        for bookmark in store.load()? {
            match self.shared.register(&bookmark.topic_key, bookmark.alias.as_deref()) {
                Ok(id) => added.push(id),
                Err(e) => tracing::warn!(error = %e, "skipping saved connection"),
            }
        }
        tracing::info!(count = added.len(), "restored connections");
        Ok(added)
    }

    /// Stop every background task and close every peer. Pending requests fail
    /// with a transport error and terminal sessions close. Records stay.
    pub fn shutdown(&self) {
        self.shared.stop_all();
    }
}

impl Shared {
    fn publish(&self, event: ClientEvent) {
        self.events.publish(event);
    }

    fn register(self: &Arc<Self>, topic_key: &str, alias: Option<&str>) -> Result<String, ManagerError> {
        let entry = ConnectionEntry::new(topic_key, alias);
        let id = entry.id.clone();
        let topic_key = entry.topic_key.clone();
        self.registry.add(entry)?;

        let remote = Remote::new(
            &id,
            self.settings.remote.clone(),
            self.factory.clone(),
            self.events.clone(),
        );
        let cancel = CancellationToken::new();
        let peers = self.discovery.join(&topic_key);

        tokio::spawn(listen(
            Arc::downgrade(self),
            id.clone(),
            remote.clone(),
            peers,
            cancel.clone(),
        ));
        self.connections.write().insert(
            id.clone(),
            ConnectionHandle {
                topic_key,
                remote,
                cancel,
            },
        );

        tracing::info!(connection = %id, "connection added");
        self.publish(ClientEvent::ConnectionAdded {
            connection_id: id.clone(),
        });
        Ok(id)
    }

    fn persist(&self) {
        let Some(ref store) = self.bookmarks else {
            return;
        };
        let bookmarks: Vec<Bookmark> = self
            .registry
            .list()
            .iter()
            .map(|e| Bookmark::new(&e.topic_key, e.alias.as_deref()))
            .collect();
        if let Err(e) = store.save(&bookmarks) {
            tracing::warn!(error = %e, "failed to persist connections");
        }
    }

    fn handle_peer_arrival(
        self: &Arc<Self>,
        id: &str,
        remote: &Arc<Remote>,
        link: PeerLink,
        cancel: &CancellationToken,
    ) {
        let Some(peer) = remote.attach(link) else {
            return;
        };
        tracing::info!(connection = %id, peer = %peer.remote_id(), "peer connected");
        self.registry.set_connected(id, Some(peer.connected_at()));
        self.publish(ClientEvent::Connected {
            connection_id: id.to_string(),
        });

        if self.registry.active().is_none() && self.registry.set_active(Some(id)).is_ok() {
            self.publish(ClientEvent::ActiveChanged {
                connection_id: Some(id.to_string()),
            });
        }
        remote.send(&Command::list_containers());

        tokio::spawn(supervise(
            Arc::downgrade(self),
            id.to_string(),
            remote.clone(),
            peer,
            cancel.child_token(),
        ));
    }

    fn handle_peer_lost(&self, id: &str, remote: &Remote, peer: &Arc<PeerConnection>) {
        if !remote.handle_peer_lost(peer) {
            return;
        }
        self.registry.set_connected(id, None);
        self.publish(ClientEvent::Disconnected {
            connection_id: id.to_string(),
        });
        if self.registry.clear_active_if(id) {
            self.publish(ClientEvent::ActiveChanged { connection_id: None });
        }
    }

    fn record_probe(&self, id: &str, outcome: ProbeOutcome) {
        if self.registry.set_health(id, outcome.health, outcome.latency_ms) {
            tracing::info!(connection = %id, health = ?outcome.health, latency_ms = ?outcome.latency_ms, "health changed");
            self.publish(ClientEvent::HealthChanged {
                connection_id: id.to_string(),
                health: outcome.health,
                latency_ms: outcome.latency_ms,
            });
        }
    }

    fn stop_all(&self) {
        for (_, handle) in self.connections.write().drain() {
            handle.cancel.cancel();
            self.discovery.leave(&handle.topic_key);
            if let Some(peer) = handle.remote.peer().take() {
                peer.close();
            }
            handle
                .remote
                .correlator()
                .reject_all(CommandError::Transport("shutting down".into()));
            handle.remote.mux().close_all();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Deliver every peer discovered on the topic until cancelled.
async fn listen(
    shared: Weak<Shared>,
    id: String,
    remote: Arc<Remote>,
    mut peers: mpsc::Receiver<PeerLink>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            link = peers.recv() => {
                let Some(link) = link else { break };
                let Some(shared) = shared.upgrade() else {
                    link.close();
                    break;
                };
                shared.handle_peer_arrival(&id, &remote, link, &cancel);
            }
        }
    }
    tracing::debug!(connection = %id, "peer listener stopped");
}

/// Probe a live peer on a fixed interval and handle its loss.
async fn supervise(
    shared: Weak<Shared>,
    id: String,
    remote: Arc<Remote>,
    peer: Arc<PeerConnection>,
    cancel: CancellationToken,
) {
    let Some(settings) = shared.upgrade().map(|s| s.settings.clone()) else {
        return;
    };
    let mut interval = tokio::time::interval(settings.probe_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // Skip the first immediate tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = peer.closed() => break,
            _ = interval.tick() => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = peer.closed() => break,
                    outcome = probe(&remote, &settings) => {
                        match shared.upgrade() {
                            Some(shared) => shared.record_probe(&id, outcome),
                            None => return,
                        }
                    }
                }
            }
        }
    }

    if let Some(shared) = shared.upgrade() {
        shared.handle_peer_lost(&id, &remote, &peer);
    }
}

/// Send a cheap listing command and time the round trip.
///
/// Watches the listing cache rather than going through the correlator, so a
/// probe can never settle, or be settled by, a user command.
async fn probe(remote: &Remote, settings: &ManagerSettings) -> ProbeOutcome {
    let mut changes = remote.listings().subscribe();
    let started = Instant::now();
    if !remote.send(&Command::list_containers()) {
        return ProbeOutcome {
            health: Health::Unhealthy,
            latency_ms: None,
        };
    }

    let answered = tokio::time::timeout(settings.probe_timeout, async {
        loop {
            match changes.recv().await {
                Ok(BroadcastKind::Containers) => return true,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await;

    match answered {
        Ok(true) => {
            let latency = started.elapsed();
            ProbeOutcome {
                health: classify_latency(latency, settings.slow_threshold),
                latency_ms: Some(latency.as_millis() as u64),
            }
        }
        _ => ProbeOutcome {
            health: Health::Slow,
            latency_ms: None,
        },
    }
}
