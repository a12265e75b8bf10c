#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use peerdock::events::ClientEvent;
use peerdock::manager::{ConnectionManager, ManagerSettings};
use peerdock::protocol::Envelope;
use peerdock::remote::RemoteSettings;
use peerdock::session::{CaptureEmulatorFactory, TerminalSize};
use peerdock::transport::memory::{MemoryDiscovery, RemoteEnd};
use serde_json::json;
use tokio::sync::broadcast;

pub const TOPIC_A: &str = "a1b2c3d4e5f60718293a4b5c6d7e8f90";
pub const TOPIC_B: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f0";

pub const WAIT: Duration = Duration::from_secs(2);

/// Settings that keep background probes out of the way unless a test
/// asks for them.
pub fn quiet_settings() -> ManagerSettings {
    ManagerSettings {
        probe_interval: Duration::from_secs(3600),
        slow_threshold: Duration::from_secs(5),
        probe_timeout: Duration::from_millis(200),
        remote: RemoteSettings {
            short_timeout: Duration::from_secs(5),
            long_timeout: Duration::from_secs(5),
            resize_debounce: Duration::from_millis(20),
            ..RemoteSettings::default()
        },
    }
}

/// A manager wired to an in-memory topic space and capturing emulators.
pub struct Harness {
    pub manager: ConnectionManager,
    pub discovery: MemoryDiscovery,
    pub factory: CaptureEmulatorFactory,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(quiet_settings())
    }

    pub fn with_settings(settings: ManagerSettings) -> Self {
        let discovery = MemoryDiscovery::new();
        let factory = CaptureEmulatorFactory::new(TerminalSize::new(80, 24));
        let manager = ConnectionManager::builder(Arc::new(discovery.clone()))
            .settings(settings)
            .emulators(Arc::new(factory.clone()))
            .build();
        Self {
            manager,
            discovery,
            factory,
        }
    }

    /// Add a Connection for `topic` and bring up one host peer on it.
    pub async fn connect(&self, topic: &str) -> (String, RemoteEnd) {
        let id = self.manager.add_connection(topic, None).unwrap();
        let host = self.announce(&id, topic).await;
        (id, host)
    }

    /// Announce a host on an already-added Connection and wait until it is
    /// the live peer.
    pub async fn announce(&self, id: &str, topic: &str) -> RemoteEnd {
        let mut events = self.manager.subscribe();
        let host = self.discovery.announce(topic).await.expect("topic joined");
        wait_for(&mut events, |e| {
            matches!(e, ClientEvent::Connected { connection_id } if connection_id == id)
        })
        .await
        .expect("peer connected");
        host
    }
}

/// Wait for the first event matching `pred`.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<ClientEvent>, mut pred: F) -> Option<ClientEvent>
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Poll `check` until it holds or the wait runs out.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn containers(ids: &[&str]) -> Envelope {
    let list: Vec<_> = ids
        .iter()
        .map(|id| json!({"Id": id, "Names": [format!("/{id}-name")], "Image": "alpine", "State": "running"}))
        .collect();
    Envelope::typed("containers", json!(list))
}
