use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::manager::ManagerSettings;
use crate::remote::RemoteSettings;

/// Client configuration, loaded from TOML. Every field is optional in the
/// file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Health probe period per connected Connection.
    pub probe_interval_ms: u64,
    /// Probe round trips at or above this are `slow`.
    pub slow_threshold_ms: u64,
    /// How long a probe waits for its listing before giving up.
    pub probe_timeout_ms: u64,
    pub short_timeout_ms: u64,
    pub long_timeout_ms: u64,
    pub resize_debounce_ms: u64,
    pub stats_alpha: f64,
    pub stats_capacity: usize,
    /// Serialized bookmark lists above this size use the overflow store.
    pub bookmark_inline_limit: usize,
    /// WebSocket relay base URL (`ws://` or `wss://`).
    pub relay: Option<String>,
    /// Bookmark store directory. Defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 10_000,
            slow_threshold_ms: 5_000,
            probe_timeout_ms: 10_000,
            short_timeout_ms: 30_000,
            long_timeout_ms: 900_000,
            resize_debounce_ms: 50,
            stats_alpha: 0.2,
            stats_capacity: 60,
            bookmark_inline_limit: crate::store::DEFAULT_INLINE_LIMIT,
            relay: None,
            data_dir: None,
        }
    }
}

impl ClientConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        // Topic keys grant access to a host; warn if others can read them.
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate().map_err(|msg| ConfigError::Invalid(path.to_path_buf(), msg))?;
        Ok(Some(config))
    }

    /// Load from `path`, or from the default location when `None`. A missing
    /// file yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        Ok(Self::load(&path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.probe_interval_ms == 0 {
            return Err("probe_interval_ms must be > 0".into());
        }
        if self.probe_timeout_ms == 0 {
            return Err("probe_timeout_ms must be > 0".into());
        }
        if self.short_timeout_ms == 0 || self.long_timeout_ms == 0 {
            return Err("command timeouts must be > 0".into());
        }
        if !(self.stats_alpha > 0.0 && self.stats_alpha <= 1.0) {
            return Err(format!("stats_alpha must be in (0, 1], got {}", self.stats_alpha));
        }
        if self.stats_capacity == 0 {
            return Err("stats_capacity must be > 0".into());
        }
        if let Some(ref relay) = self.relay {
            crate::transport::ws::validate_relay_url(relay)?;
        }
        Ok(())
    }

    pub fn remote_settings(&self) -> RemoteSettings {
        RemoteSettings {
            short_timeout: Duration::from_millis(self.short_timeout_ms),
            long_timeout: Duration::from_millis(self.long_timeout_ms),
            resize_debounce: Duration::from_millis(self.resize_debounce_ms),
            stats_alpha: self.stats_alpha,
            stats_capacity: self.stats_capacity,
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            slow_threshold: Duration::from_millis(self.slow_threshold_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            remote: self.remote_settings(),
        }
    }

    /// Bookmark directory: `data_dir` if set, else `<platform data dir>/peerdock`.
    pub fn resolved_data_dir(&self) -> Option<PathBuf> {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join("peerdock")))
    }
}

/// `$XDG_CONFIG_HOME/peerdock/config.toml` (platform equivalent elsewhere).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("peerdock").join("config.toml"))
}

/// Errors that can occur when loading or saving config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(PathBuf, String),
    WriteFailed(PathBuf, std::io::Error),
    SerializeFailed(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(path, msg) => {
                write!(f, "Invalid config {}: {}", path.display(), msg)
            }
            Self::WriteFailed(path, e) => {
                write!(f, "Failed to write config {}: {}", path.display(), e)
            }
            Self::SerializeFailed(e) => write!(f, "Failed to serialize config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn if a config file is world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             Relay URLs and data paths may reveal hosts; consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
