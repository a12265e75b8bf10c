//! Persistence of the Connection bookmark set.
//!
//! Bookmarks (topic + alias, never live state) are a small JSON list. It is
//! written to a size-bounded store when it fits and to an unbounded one when
//! it doesn't; loading checks the small store first.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Above this many bytes the bookmark list goes to the overflow store.
pub const DEFAULT_INLINE_LIMIT: usize = 4000;

const BOOKMARKS_KEY: &str = "connections";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("value of {len} bytes exceeds store capacity of {capacity}")]
    CapacityExceeded { len: usize, capacity: usize },
    #[error("invalid store key: {0}")]
    InvalidKey(String),
    #[error("corrupt bookmark data: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Get/set by key. No transactions.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let ok = !key.is_empty()
        && key.len() <= 64
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// In-memory store, optionally refusing values above `capacity` bytes.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    capacity: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if let Some(capacity) = self.capacity {
            if value.len() > capacity {
                return Err(StoreError::CapacityExceeded {
                    len: value.len(),
                    capacity,
                });
            }
        }
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// One file per key under a directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path(key)?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path(key)?;
        std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        // Write then rename so a crash never leaves a half-written list.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

/// A saved Connection: enough to re-add it, nothing live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    pub topic_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Bookmark {
    pub fn new(topic_key: &str, alias: Option<&str>) -> Self {
        Self {
            topic_key: topic_key.to_string(),
            alias: alias.map(str::to_string),
        }
    }
}

/// Where the last save landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Inline,
    Overflow,
}

#[derive(Clone)]
pub struct BookmarkStore {
    inline: Arc<dyn KeyValueStore>,
    overflow: Arc<dyn KeyValueStore>,
    inline_limit: usize,
}

impl BookmarkStore {
    pub fn new(
        inline: Arc<dyn KeyValueStore>,
        overflow: Arc<dyn KeyValueStore>,
        inline_limit: usize,
    ) -> Self {
        Self {
            inline,
            overflow,
            inline_limit,
        }
    }

    /// Both tiers in memory. The inline tier enforces `inline_limit`.
    pub fn in_memory(inline_limit: usize) -> Self {
        Self::new(
            Arc::new(MemoryStore::with_capacity(inline_limit)),
            Arc::new(MemoryStore::new()),
            inline_limit,
        )
    }

    /// Both tiers on disk: `dir/inline` and `dir/overflow`.
    pub fn on_disk(dir: &Path, inline_limit: usize) -> Self {
        Self::new(
            Arc::new(FileStore::new(dir.join("inline"))),
            Arc::new(FileStore::new(dir.join("overflow"))),
            inline_limit,
        )
    }

    pub fn save(&self, bookmarks: &[Bookmark]) -> Result<Tier, StoreError> {
        let json = serde_json::to_string(bookmarks)?;
        if json.len() <= self.inline_limit {
            match self.inline.set(BOOKMARKS_KEY, &json) {
                Ok(()) => {
                    self.overflow.remove(BOOKMARKS_KEY)?;
                    return Ok(Tier::Inline);
                }
                Err(StoreError::CapacityExceeded { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.overflow.set(BOOKMARKS_KEY, &json)?;
        self.inline.remove(BOOKMARKS_KEY)?;
        tracing::debug!(bytes = json.len(), "bookmarks written to overflow store");
        Ok(Tier::Overflow)
    }

    pub fn load(&self) -> Result<Vec<Bookmark>, StoreError> {
        let json = match self.inline.get(BOOKMARKS_KEY)? {
            Some(json) => json,
            None => match self.overflow.get(BOOKMARKS_KEY)? {
                Some(json) => json,
                None => return Ok(Vec::new()),
            },
        };
        Ok(serde_json::from_str(&json)?)
    }
}
