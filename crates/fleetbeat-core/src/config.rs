//! Configuration system for fleetbeat.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FLEETBEAT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/fleetbeat/{node,collector}.toml
//!   3. ~/.config/fleetbeat/{node,collector}.toml

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::snapshot::ConfigSnapshot;

// ── Node ──────────────────────────────────────────────────────────────────────

/// Configuration of a telemetry node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub server: ServerEndpoint,
    pub connect: ConnectConfig,
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEndpoint {
    /// Collector host name or address.
    pub address: String,
    pub port: u16,
    /// WebSocket path on the collector.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Pause between failed dial attempts.
    pub interval_ms: u64,
    /// Total time one `connect()` may spend dialing.
    pub period_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Binary identity record. Created on first successful handshake.
    pub path: PathBuf,
    /// Descriptive attributes used when no identity file exists yet.
    pub region: String,
    pub zone: String,
    pub datacenter: String,
}

// ── Collector ─────────────────────────────────────────────────────────────────

/// Configuration of the collector server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub network: NetworkConfig,
    /// Snapshot handed to every node at handshake.
    pub defaults: ConfigSnapshot,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_address: String,
    /// WebSocket port nodes connect to.
    pub port: u16,
    /// Local HTTP status API port. Bound to 127.0.0.1 only.
    pub api_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Node identity records, one file per node id.
    pub identity_dir: PathBuf,
    /// Where accepted samples go: "log", "jsonl" or "memory".
    pub sink: String,
    /// Output directory for the "jsonl" sink.
    pub samples_dir: PathBuf,
    /// Batches retained per node by the in-memory view.
    pub retain_batches: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerEndpoint {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            path: "/ws".to_string(),
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            period_ms: 30_000,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("node.id"),
            region: String::new(),
            zone: String::new(),
            datacenter: String::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            api_port: DEFAULT_API_PORT,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            identity_dir: data_dir().join("identities"),
            sink: "log".to_string(),
            samples_dir: data_dir().join("samples"),
            retain_batches: 64,
        }
    }
}

/// Default WebSocket port.
pub const DEFAULT_PORT: u16 = 7070;

/// Default status API port.
pub const DEFAULT_API_PORT: u16 = 7071;

impl ServerEndpoint {
    /// `ws://address:port/path`
    pub fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("ws://{}:{}{}", self.address, self.port, path)
    }
}

impl ConnectConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("fleetbeat")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("fleetbeat")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Shared load/save behaviour for the node and collector config files.
pub trait ConfigFile: Default + Serialize + DeserializeOwned {
    /// File name under the config directory.
    const FILE_NAME: &'static str;

    /// Apply FLEETBEAT_* env var overrides.
    fn apply_env_overrides(&mut self);

    /// Config file path.
    fn file_path() -> PathBuf {
        std::env::var("FLEETBEAT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join(Self::FILE_NAME))
    }

    /// Load config: env vars → file → defaults.
    fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load, falling back to defaults (with a warning) on any error.
    fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            let mut config = Self::default();
            config.apply_env_overrides();
            config
        })
    }

    /// Write default config if none exists. Returns the path.
    fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text =
                toml::to_string_pretty(&Self::default()).map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }
}

impl ConfigFile for NodeConfig {
    const FILE_NAME: &'static str = "node.toml";

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FLEETBEAT_SERVER__ADDRESS") {
            self.server.address = v;
        }
        if let Some(p) = env_parse("FLEETBEAT_SERVER__PORT") {
            self.server.port = p;
        }
        if let Some(ms) = env_parse("FLEETBEAT_CONNECT__INTERVAL_MS") {
            self.connect.interval_ms = ms;
        }
        if let Some(ms) = env_parse("FLEETBEAT_CONNECT__PERIOD_MS") {
            self.connect.period_ms = ms;
        }
        if let Ok(v) = std::env::var("FLEETBEAT_IDENTITY__PATH") {
            self.identity.path = PathBuf::from(v);
        }
    }
}

impl ConfigFile for CollectorConfig {
    const FILE_NAME: &'static str = "collector.toml";

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FLEETBEAT_NETWORK__LISTEN_ADDRESS") {
            self.network.listen_address = v;
        }
        if let Some(p) = env_parse("FLEETBEAT_NETWORK__PORT") {
            self.network.port = p;
        }
        if let Some(p) = env_parse("FLEETBEAT_NETWORK__API_PORT") {
            self.network.api_port = p;
        }
        if let Ok(v) = std::env::var("FLEETBEAT_STORAGE__SINK") {
            self.storage.sink = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
