//! Read-through cache of broadcast listings.
//!
//! Keeps the last payload per broadcast kind so a view can render
//! immediately on focus instead of waiting for the next refresh.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::protocol::BroadcastKind;

/// The fields of a container listing entry a client cares about.
///
/// Hosts differ in casing (`Id` vs `id`), so fields are read leniently.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: Option<String>,
    pub image: Option<String>,
    pub state: Option<String>,
    pub status: Option<String>,
}

impl ContainerSummary {
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        };
        let name = text(&["Name", "name"]).or_else(|| {
            obj.get("Names")
                .and_then(Value::as_array)
                .and_then(|names| names.first())
                .and_then(Value::as_str)
                .map(|n| n.trim_start_matches('/').to_string())
        });
        Some(Self {
            id: text(&["Id", "id", "ID"])?,
            name,
            image: text(&["Image", "image"]),
            state: text(&["State", "state"]),
            status: text(&["Status", "status"]),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("running"))
    }
}

pub struct ListingStore {
    listings: RwLock<HashMap<BroadcastKind, Value>>,
    changes: broadcast::Sender<BroadcastKind>,
}

impl Default for ListingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ListingStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            listings: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Replace the cached payload for `kind` and notify subscribers.
    pub fn update(&self, kind: BroadcastKind, data: Value) {
        self.listings.write().insert(kind.clone(), data);
        // Ignore error - means no receivers
        let _ = self.changes.send(kind);
    }

    pub fn get(&self, kind: &BroadcastKind) -> Option<Value> {
        self.listings.read().get(kind).cloned()
    }

    /// Parsed container listing. Empty if none has arrived yet.
    pub fn containers(&self) -> Vec<ContainerSummary> {
        self.get(&BroadcastKind::Containers)
            .as_ref()
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(ContainerSummary::from_value).collect())
            .unwrap_or_default()
    }

    /// Ids present in the latest container listing.
    pub fn subject_ids(&self) -> HashSet<String> {
        self.containers().into_iter().map(|c| c.id).collect()
    }

    pub fn kinds(&self) -> Vec<BroadcastKind> {
        self.listings.read().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.listings.write().clear();
    }

    /// Receive the kind of every listing replaced from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastKind> {
        self.changes.subscribe()
    }

    /// The cached payload for `kind`, waiting up to `wait` for one to arrive.
    pub async fn wait_for(&self, kind: &BroadcastKind, wait: Duration) -> Option<Value> {
        // Subscribe before reading so an update between the two is not missed.
        let mut changes = self.subscribe();
        if let Some(value) = self.get(kind) {
            return Some(value);
        }
        tokio::time::timeout(wait, async {
            loop {
                match changes.recv().await {
                    Ok(changed) if &changed == kind => {
                        if let Some(value) = self.get(kind) {
                            return Some(value);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(value) = self.get(kind) {
                            return Some(value);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }
}
