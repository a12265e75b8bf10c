use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Length of the short connection id derived from a topic key.
pub const CONNECTION_ID_LEN: usize = 12;

const MAX_ALIAS_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Unknown,
    Healthy,
    Slow,
    Unhealthy,
}

/// Classify a completed probe round trip.
pub fn classify_latency(latency: Duration, slow_threshold: Duration) -> Health {
    if latency < slow_threshold {
        Health::Healthy
    } else {
        Health::Slow
    }
}

/// Bookkeeping for one remote host. The live peer itself lives in the
/// connection's [`crate::remote::Remote`]; this record only mirrors whether
/// there is one.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEntry {
    pub id: String,
    #[serde(skip_serializing)]
    pub topic_key: String,
    pub alias: Option<String>,
    pub connected_at: Option<SystemTime>,
    pub health: Health,
    pub latency_ms: Option<u64>,
}

impl ConnectionEntry {
    pub fn new(topic_key: &str, alias: Option<&str>) -> Self {
        Self {
            id: connection_id_for(topic_key),
            topic_key: topic_key.to_lowercase(),
            alias: alias.map(str::to_string),
            connected_at: None,
            health: Health::Unknown,
            latency_ms: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected_at.is_some()
    }

    /// Alias if set, otherwise the short id.
    pub fn label(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("connection already registered: {0}")]
    Duplicate(String),
    #[error("connection not found: {0}")]
    NotFound(String),
    #[error("invalid topic key: {0}")]
    InvalidTopic(String),
    #[error("invalid alias: {0}")]
    InvalidAlias(String),
}

/// Stable short id for a topic: the first 12 hex chars, lowercased.
pub fn connection_id_for(topic_key: &str) -> String {
    topic_key
        .chars()
        .take(CONNECTION_ID_LEN)
        .collect::<String>()
        .to_lowercase()
}

/// Validate a discovery topic key.
///
/// - Must be 8-128 characters.
/// - Hex digits only.
pub fn validate_topic_key(topic_key: &str) -> Result<(), String> {
    if topic_key.len() < 8 {
        return Err(format!(
            "topic key too short ({} chars, min 8)",
            topic_key.len()
        ));
    }
    if topic_key.len() > 128 {
        return Err(format!(
            "topic key too long ({} chars, max 128)",
            topic_key.len()
        ));
    }
    if !topic_key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("topic key must be hexadecimal".into());
    }
    Ok(())
}

/// Validate a user label. 1-64 printable characters.
pub fn validate_alias(alias: &str) -> Result<(), String> {
    if alias.trim().is_empty() {
        return Err("alias must not be blank".into());
    }
    if alias.chars().count() > MAX_ALIAS_LEN {
        return Err(format!("alias too long (max {MAX_ALIAS_LEN} chars)"));
    }
    if alias.chars().any(char::is_control) {
        return Err("alias contains control characters".into());
    }
    Ok(())
}

#[derive(Default)]
struct RegistryInner {
    entries: Vec<ConnectionEntry>,
    active: Option<String>,
}

/// All known Connections plus the single active pointer.
///
/// Cloning shares the same underlying state.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Validates the topic (and alias if present), then
    /// rejects a duplicate topic or a colliding short id.
    pub fn add(&self, entry: ConnectionEntry) -> Result<(), RegistryError> {
        validate_topic_key(&entry.topic_key).map_err(RegistryError::InvalidTopic)?;
        if let Some(ref alias) = entry.alias {
            validate_alias(alias).map_err(RegistryError::InvalidAlias)?;
        }

        let mut inner = self.inner.write();
        if inner
            .entries
            .iter()
            .any(|e| e.topic_key == entry.topic_key || e.id == entry.id)
        {
            return Err(RegistryError::Duplicate(entry.id));
        }
        inner.entries.push(entry);
        Ok(())
    }

    /// Remove an entry, clearing the active pointer if it pointed here.
    pub fn remove(&self, id: &str) -> Option<ConnectionEntry> {
        let mut inner = self.inner.write();
        let pos = inner.entries.iter().position(|e| e.id == id)?;
        if inner.active.as_deref() == Some(id) {
            inner.active = None;
        }
        Some(inner.entries.remove(pos))
    }

    pub fn get(&self, id: &str) -> Option<ConnectionEntry> {
        self.inner.read().entries.iter().find(|e| e.id == id).cloned()
    }

    pub fn get_by_topic(&self, topic_key: &str) -> Option<ConnectionEntry> {
        let topic_key = topic_key.to_lowercase();
        self.inner
            .read()
            .entries
            .iter()
            .find(|e| e.topic_key == topic_key)
            .cloned()
    }

    pub fn list(&self) -> Vec<ConnectionEntry> {
        self.inner.read().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn active(&self) -> Option<String> {
        self.inner.read().active.clone()
    }

    /// Point command routing at `id`. Only the manager calls this.
    pub(crate) fn set_active(&self, id: Option<&str>) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if let Some(id) = id {
            if !inner.entries.iter().any(|e| e.id == id) {
                return Err(RegistryError::NotFound(id.to_string()));
            }
        }
        inner.active = id.map(str::to_string);
        Ok(())
    }

    /// Clear the active pointer if it points at `id`. Returns true if cleared.
    pub(crate) fn clear_active_if(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.active.as_deref() == Some(id) {
            inner.active = None;
            return true;
        }
        false
    }

    pub(crate) fn set_connected(&self, id: &str, connected_at: Option<SystemTime>) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.id == id) {
            entry.connected_at = connected_at;
            if connected_at.is_none() {
                entry.health = Health::Unknown;
                entry.latency_ms = None;
            }
        }
    }

    /// Record a probe result. Returns true if the health class changed.
    pub(crate) fn set_health(&self, id: &str, health: Health, latency_ms: Option<u64>) -> bool {
        let mut inner = self.inner.write();
        match inner.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                let changed = entry.health != health;
                entry.health = health;
                entry.latency_ms = latency_ms;
                changed
            }
            None => false,
        }
    }

    pub(crate) fn set_alias(&self, id: &str, alias: Option<&str>) -> Result<(), RegistryError> {
        if let Some(alias) = alias {
            validate_alias(alias).map_err(RegistryError::InvalidAlias)?;
        }
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        entry.alias = alias.map(str::to_string);
        Ok(())
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.active = None;
    }
}
