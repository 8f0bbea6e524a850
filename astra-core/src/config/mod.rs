//! Configuration management for Astra replicas
//!
//! TOML file loading, `ASTRA_*` environment overrides, defaults and
//! validation. Durations are written in humantime form (`"5s"`, `"2m"`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main replica configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub replica: ReplicaConfig,
    pub discovery: DiscoveryConfig,
    pub sync: SyncConfig,
    pub pairing: PairingConfig,
    pub logging: LoggingConfig,
    pub features: FeatureConfig,
}

/// Identity and storage of this replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Name shown to other devices
    pub display_name: String,

    /// Directory holding identity, peers, oplog and checkpoint
    pub data_dir: PathBuf,

    /// Sync listener address
    pub listen_address: SocketAddr,
}

/// Local network discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,

    /// UDP address the discovery socket binds
    pub bind_address: SocketAddr,

    /// Where announcements are sent
    pub broadcast_address: SocketAddr,

    #[serde(with = "humantime_serde")]
    pub advertisement_interval: Duration,

    /// Peers silent for longer are marked unreachable
    #[serde(with = "humantime_serde")]
    pub peer_stale_timeout: Duration,
}

/// Sync scheduling and retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Sync trusted peers in the background; off means only explicit syncs
    pub auto_sync: bool,

    /// First reconnect delay
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Per-attempt cap and total retry budget
    #[serde(with = "humantime_serde")]
    pub retry_ceiling: Duration,

    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,

    /// How often every reachable peer is synced
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub checkpoint_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Unconfirmed pairing candidates expire after this
    #[serde(with = "humantime_serde")]
    pub confirmation_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include target module
    pub with_target: bool,
}

/// Feature handlers switched on or off by name; unlisted features are enabled
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub enabled: BTreeMap<String, bool>,
}

impl FeatureConfig {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.get(name).copied().unwrap_or(true)
    }
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            display_name: "astra".to_string(),
            data_dir: PathBuf::from("./data"),
            listen_address: SocketAddr::from(([0, 0, 0, 0], 47801)),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: SocketAddr::from(([0, 0, 0, 0], 47800)),
            broadcast_address: SocketAddr::from(([255, 255, 255, 255], 47800)),
            advertisement_interval: Duration::from_secs(5),
            peer_stale_timeout: Duration::from_secs(90),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: true,
            initial_backoff: Duration::from_millis(250),
            retry_ceiling: Duration::from_secs(30),
            session_timeout: Duration::from_secs(60),
            sync_interval: Duration::from_secs(30),
            checkpoint_interval: Duration::from_secs(300),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self { confirmation_timeout: Duration::from_secs(120) }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json_format: false, with_target: true }
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

fn env_secs(name: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_env::<u64>(name)?.map(Duration::from_secs))
}

impl Config {
    /// Load configuration from environment variables on top of defaults
    ///
    /// Example: ASTRA_DATA_DIR=/var/lib/astra ASTRA_LOG_LEVEL=debug
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `ASTRA_*` variables that are set
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(name) = env::var("ASTRA_DISPLAY_NAME") {
            self.replica.display_name = name;
        }
        if let Ok(data_dir) = env::var("ASTRA_DATA_DIR") {
            self.replica.data_dir = PathBuf::from(data_dir);
        }
        if let Some(addr) = parse_env("ASTRA_LISTEN_ADDRESS")? {
            self.replica.listen_address = addr;
        }
        if let Some(interval) = env_secs("ASTRA_ADVERTISEMENT_INTERVAL_SECS")? {
            self.discovery.advertisement_interval = interval;
        }
        if let Some(timeout) = env_secs("ASTRA_PEER_STALE_TIMEOUT_SECS")? {
            self.discovery.peer_stale_timeout = timeout;
        }
        if let Some(auto_sync) = parse_env("ASTRA_AUTO_SYNC")? {
            self.sync.auto_sync = auto_sync;
        }
        if let Some(ceiling) = env_secs("ASTRA_SYNC_RETRY_CEILING_SECS")? {
            self.sync.retry_ceiling = ceiling;
        }
        if let Some(timeout) = env_secs("ASTRA_PAIRING_TIMEOUT_SECS")? {
            self.pairing.confirmation_timeout = timeout;
        }
        if let Ok(level) = env::var("ASTRA_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = parse_env("ASTRA_LOG_JSON")? {
            self.logging.json_format = json;
        }
        Ok(())
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("discovery.advertisement_interval", self.discovery.advertisement_interval),
            ("discovery.peer_stale_timeout", self.discovery.peer_stale_timeout),
            ("sync.initial_backoff", self.sync.initial_backoff),
            ("sync.retry_ceiling", self.sync.retry_ceiling),
            ("sync.session_timeout", self.sync.session_timeout),
            ("sync.sync_interval", self.sync.sync_interval),
            ("sync.checkpoint_interval", self.sync.checkpoint_interval),
            ("pairing.confirmation_timeout", self.pairing.confirmation_timeout),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!("{} must be non-zero", name)));
            }
        }

        if self.sync.initial_backoff > self.sync.retry_ceiling {
            return Err(ConfigError::ValidationFailed(
                "sync.initial_backoff must not exceed sync.retry_ceiling".to_string(),
            ));
        }

        if self.replica.display_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "replica.display_name must not be empty".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        let path = path.as_ref();
        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery.advertisement_interval, Duration::from_secs(5));
        assert_eq!(config.discovery.peer_stale_timeout, Duration::from_secs(90));
        assert_eq!(config.sync.retry_ceiling, Duration::from_secs(30));
        assert_eq!(config.pairing.confirmation_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.discovery.advertisement_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        config = Config::default();
        config.sync.initial_backoff = Duration::from_secs(60);
        assert!(config.validate().is_err());

        config = Config::default();
        config.replica.display_name = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = Config::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("astra.toml");
        std::fs::write(
            &path,
            "[replica]\ndisplay_name = \"kitchen\"\n\n[discovery]\nadvertisement_interval = \"2s\"\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.replica.display_name, "kitchen");
        assert_eq!(config.discovery.advertisement_interval, Duration::from_secs(2));
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("astra.toml");
        let mut config = Config::default();
        config.features.enabled.insert("weather".to_string(), false);

        config.save_to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();

        assert_eq!(loaded, config);
        assert!(!loaded.features.is_enabled("weather"));
        assert!(loaded.features.is_enabled("notes"));
    }
}
