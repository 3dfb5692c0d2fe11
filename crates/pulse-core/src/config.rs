use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::geo::ProviderKind;

/// Top-level application configuration, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub tracker: TrackerConfig,
    pub storage: StorageConfig,
    pub geo: GeoConfig,
    pub sync: SyncConfig,
    pub stats: StatsConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Load configuration from default path (~/.config/visitor-pulse/config.toml),
    /// falling back to defaults if the file doesn't exist.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Write current configuration to the default path.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;
        Ok(())
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("visitor-pulse")
            .join("config.toml")
    }

    /// Data directory for the durable analytics store.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("visitor-pulse")
    }

    /// Resolved durable store directory (configured or default).
    pub fn store_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("store"))
    }
}

/// Session tracker timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Interval between automatic heartbeats, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Minimum gap between activity-triggered heartbeats, in seconds.
    pub activity_throttle_secs: u64,
    /// A session without a heartbeat for this long no longer counts as online.
    /// Zero keeps a session online until it records an exit.
    pub stale_after_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            activity_throttle_secs: 5,
            stale_after_secs: 60,
        }
    }
}

/// Durable store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the durable scope.
    pub data_dir: Option<PathBuf>,
    /// Maximum number of visitor sessions kept in history.
    pub history_cap: usize,
    /// Daily aggregate rows older than this many days are pruned.
    pub retention_days: u32,
    /// Watch the store directory for writes from other processes.
    pub watch: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None, // resolved at runtime to data_dir/store
            history_cap: 500,
            retention_days: 90,
            watch: true,
        }
    }
}

/// Geolocation lookup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    pub enabled: bool,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Lookup endpoints, tried in order.
    pub providers: Vec<GeoProviderConfig>,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 3000,
            providers: vec![
                GeoProviderConfig::new("ipapi", "https://ipapi.co/json/", ProviderKind::IpapiCo),
                GeoProviderConfig::new(
                    "ip-api",
                    "http://ip-api.com/json/",
                    ProviderKind::IpApiCom,
                ),
                GeoProviderConfig::new("ipinfo", "https://ipinfo.io/json", ProviderKind::Ipinfo),
                GeoProviderConfig::new(
                    "ipify",
                    "https://api.ipify.org?format=json",
                    ProviderKind::Ipify,
                ),
            ],
        }
    }
}

/// A single geolocation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoProviderConfig {
    pub name: String,
    pub url: String,
    /// Response shape served by the endpoint.
    pub kind: ProviderKind,
}

impl GeoProviderConfig {
    pub fn new(name: &str, url: &str, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            kind,
        }
    }
}

/// Subscription refresh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Poll interval for subscribers, in milliseconds. Also the staleness bound.
    pub poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
        }
    }
}

/// Statistics shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Number of history entries in `recent_visitors`.
    pub recent_limit: usize,
    /// Number of daily rows in the chart series.
    pub series_days: usize,
    /// Number of rows in the top pages / referrers lists.
    pub top_limit: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            recent_limit: 50,
            series_days: 7,
            top_limit: 10,
        }
    }
}

/// HTTP dashboard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Bearer token for authentication (None = no auth).
    pub auth_token: Option<String>,
    /// Enable CORS.
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            auth_token: None,
            cors: true,
        }
    }
}
