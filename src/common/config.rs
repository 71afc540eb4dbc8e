//! Configuration for consul-coord components

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "consul-coord.toml";

/// Environment variable overriding the config file path.
pub const CONFIG_PATH_ENV: &str = "CONSUL_COORD_CONFIG";

/// Prefix for environment overrides, e.g. `CONSUL_COORD__CONSUL__ADDR`.
pub const ENV_PREFIX: &str = "CONSUL_COORD";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Consul agent connection
    pub consul: ConsulConfig,

    /// Distributed lock tuning
    pub lock: LockConfig,

    /// Coordinated shutdown
    pub shutdown: ShutdownConfig,

    /// Traffic-weighted version shifting
    pub shift: ShiftConfig,

    /// Logging level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            consul: ConsulConfig::default(),
            lock: LockConfig::default(),
            shutdown: ShutdownConfig::default(),
            shift: ShiftConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Consul agent connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    /// Base URL of the local agent
    pub addr: String,

    /// Long-poll wait attached to blocking queries
    pub wait_ms: u64,

    /// Slack added on top of the wait to bound each round trip
    pub request_timeout_ms: u64,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            addr: "http://127.0.0.1:8500".to_string(),
            wait_ms: 10_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl ConsulConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Backend-enforced cooldown after a lock is lost involuntarily
    pub lock_delay_ms: u64,

    /// Pause before re-acquiring when the key was already free
    pub retry_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_delay_ms: 5_000,
            retry_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Passing instances that must remain after this node leaves
    pub min_nodes: usize,

    /// Drain time after unhealthiness has propagated
    pub grace_period_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            min_nodes: 1,
            grace_period_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShiftConfig {
    /// Service whose versions are shifted
    pub service: String,

    /// Floor of nodes per version
    pub min_nodes: usize,

    /// Address of the locally running service
    pub service_addr: SocketAddr,

    /// Local version marker
    pub version_file: PathBuf,
}

impl Default for ShiftConfig {
    fn default() -> Self {
        Self {
            service: "testdrive".to_string(),
            min_nodes: 1,
            service_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            version_file: PathBuf::from("VERSION"),
        }
    }
}

impl Config {
    /// Config file path: `CONSUL_COORD_CONFIG` or `consul-coord.toml`.
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Load from the default path and the environment. A missing file means
    /// defaults; a file that does not parse is an error.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load from an optional file at `path`, then apply environment overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the coordination loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.consul.addr.starts_with("http://") || self.consul.addr.starts_with("https://")) {
            return Err(Error::InvalidConfig(format!(
                "consul.addr must be an http(s) URL, got {}",
                self.consul.addr
            )));
        }
        if self.consul.wait_ms == 0 {
            return Err(Error::InvalidConfig("consul.wait_ms must be positive".into()));
        }
        if self.consul.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig("consul.request_timeout_ms must be positive".into()));
        }
        if self.shift.service.is_empty() {
            return Err(Error::InvalidConfig("shift.service must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.consul.addr, "http://127.0.0.1:8500");
        assert_eq!(config.consul.wait(), Duration::from_secs(10));
        assert_eq!(config.lock.lock_delay_ms, 5_000);
        assert_eq!(config.shutdown.min_nodes, 1);
        assert_eq!(config.shift.service, "testdrive");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.shutdown.grace_period_ms, 3_000);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("consul-coord.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[consul]\naddr = \"http://consul.internal:8500\"\n\n[shutdown]\nmin_nodes = 3"
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.consul.addr, "http://consul.internal:8500");
        assert_eq!(config.consul.wait_ms, 10_000);
        assert_eq!(config.shutdown.min_nodes, 3);
        assert_eq!(config.shutdown.grace_period_ms, 3_000);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("consul-coord.toml");
        std::fs::write(&path, "[shutdown]\nmin_nodes = 3\ngrace_period_ms = \"3s\"\n").unwrap();

        match Config::load_from(&path) {
            Err(Error::Config(e)) => assert!(e.to_string().contains("grace_period_ms"), "{}", e),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("consul-coord.toml");
        std::fs::write(&path, "[consul]\naddr = \"127.0.0.1:8500\"\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.consul.wait_ms = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        assert!(Config::default().validate().is_ok());
    }
}
