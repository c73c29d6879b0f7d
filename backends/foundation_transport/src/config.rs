//! Process-wide transport configuration.
//!
//! WHY: The request timeout used by the streaming loop and the pool limits
//! are fixed once at process start and must be readable from any thread
//! without locking.
//!
//! WHAT: [`TransportConfig`] deserialised from TOML, plus an init-once global
//! snapshot ([`init`] / [`global`]). Callers override the timeout per call via
//! [`crate::StreamOptions`].

use derive_more::derive::From;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_IDLE_PER_KEY: usize = 10;
const DEFAULT_MAX_IDLE_TIME_MS: u64 = 300_000;
const DEFAULT_REAP_INTERVAL_MS: u64 = 30_000;
const DEFAULT_REGISTRY_SHARDS: usize = 16;
const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Floor for the reaper tick; the coordinator waits on its mailbox this long
/// at least between passes.
const MIN_REAP_INTERVAL_MS: u64 = 10;

static GLOBAL_CONFIG: OnceLock<TransportConfig> = OnceLock::new();

#[derive(Debug, From)]
pub enum ConfigError {
    #[from(ignore)]
    IOError(std::io::Error),

    #[from(ignore)]
    DeserializationFailed(toml::de::Error),

    #[from(ignore)]
    AlreadyInitialized,
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        Self::DeserializationFailed(value)
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl std::error::Error for ConfigError {}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Transport settings.
///
/// Every field has a default, so a TOML file only lists what it changes:
///
/// ```toml
/// timeout_ms = 2500
///
/// [pool]
/// max_idle_per_key = 4
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Default window the streaming loop waits for the next transport message.
    pub timeout_ms: u64,
    /// Optional bound on TCP connect, per resolved address.
    pub connect_timeout_ms: Option<u64>,
    pub pool: PoolSettings,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Idle connections retained per pool key; the oldest is closed beyond it.
    pub max_idle_per_key: usize,
    /// Idle connections older than this are reaped.
    pub max_idle_time_ms: u64,
    /// How often the coordinator runs the reaper.
    pub reap_interval_ms: u64,
    /// Number of independently locked registry shards.
    pub registry_shards: usize,
    /// Coordinator restarts allowed before the pool gives up.
    pub max_restarts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            connect_timeout_ms: None,
            pool: PoolSettings::default(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle_per_key: DEFAULT_MAX_IDLE_PER_KEY,
            max_idle_time_ms: DEFAULT_MAX_IDLE_TIME_MS,
            reap_interval_ms: DEFAULT_REAP_INTERVAL_MS,
            registry_shards: DEFAULT_REGISTRY_SHARDS,
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }
}

impl TransportConfig {
    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DeserializationFailed`] for malformed TOML or
    /// mistyped fields.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Reads and parses a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::IOError`] when the file cannot be read and
    /// [`ConfigError::DeserializationFailed`] when it does not parse.
    pub fn from_path<V: Into<std::path::PathBuf>>(target: V) -> ConfigResult<Self> {
        let target_path = target.into();
        let config_content = std::fs::read_to_string(target_path)?;
        Self::from_toml_str(&config_content)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

impl PoolSettings {
    #[must_use]
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    /// Reaper period, never below 10 ms.
    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(MIN_REAP_INTERVAL_MS))
    }
}

/// Installs the process-wide configuration snapshot.
///
/// # Errors
///
/// Returns [`ConfigError::AlreadyInitialized`] when a snapshot is already in
/// place, either from an earlier `init` or because [`global`] was read first.
pub fn init(config: TransportConfig) -> ConfigResult<&'static TransportConfig> {
    let mut installed = false;
    let snapshot = GLOBAL_CONFIG.get_or_init(|| {
        installed = true;
        config
    });

    if installed {
        info!("transport configuration installed: {:?}", snapshot);
        Ok(snapshot)
    } else {
        Err(ConfigError::AlreadyInitialized)
    }
}

/// Returns the process-wide configuration, falling back to defaults when
/// [`init`] was never called.
pub fn global() -> &'static TransportConfig {
    GLOBAL_CONFIG.get_or_init(TransportConfig::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// WHY: The default request timeout is part of the public contract
    /// WHAT: Tests defaults match the documented values
    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.timeout(), Duration::from_millis(5_000));
        assert_eq!(config.connect_timeout(), None);
        assert_eq!(config.pool.max_idle_per_key, 10);
        assert_eq!(config.pool.registry_shards, 16);
    }

    /// WHY: Partial files must keep defaults for unspecified fields
    /// WHAT: Tests serde(default) on both levels
    #[test]
    fn test_partial_toml() {
        let config = TransportConfig::from_toml_str(
            r"
timeout_ms = 250

[pool]
max_idle_per_key = 2
",
        )
        .expect("should parse");

        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert_eq!(config.pool.max_idle_per_key, 2);
        assert_eq!(config.pool.max_idle_time_ms, DEFAULT_MAX_IDLE_TIME_MS);
    }

    /// WHY: Mistyped values must not silently fall back to defaults
    /// WHAT: Tests that a string timeout fails deserialization
    #[test]
    fn test_invalid_toml() {
        let result = TransportConfig::from_toml_str("timeout_ms = \"fast\"");
        assert!(matches!(result, Err(ConfigError::DeserializationFailed(_))));
    }

    /// WHY: Missing files are reported as IO errors
    /// WHAT: Tests from_path on a path that does not exist
    #[test]
    fn test_missing_file() {
        let result = TransportConfig::from_path("/definitely/not/here/transport.toml");
        assert!(matches!(result, Err(ConfigError::IOError(_))));
    }

    #[test]
    fn test_with_timeout_override() {
        let config = TransportConfig::default().with_timeout(Duration::from_millis(42));
        assert_eq!(config.timeout_ms, 42);
    }

    /// WHY: A zero tick would have the pool coordinator spin without waiting
    /// WHAT: Tests reap_interval is clamped to its floor
    #[test]
    fn test_reap_interval_has_floor() {
        let config = TransportConfig::from_toml_str("[pool]\nreap_interval_ms = 0\n").unwrap();
        assert_eq!(
            config.pool.reap_interval(),
            Duration::from_millis(MIN_REAP_INTERVAL_MS)
        );

        let config = TransportConfig::from_toml_str("[pool]\nreap_interval_ms = 250\n").unwrap();
        assert_eq!(config.pool.reap_interval(), Duration::from_millis(250));
    }
}
