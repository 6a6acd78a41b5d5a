//! Configuration module for the gateway.
//!
//! Loads structured configuration from a TOML file with field-level
//! defaults, plus a thin environment-variable override layer for the
//! backend endpoint (useful in container deployments).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend process endpoint
    #[serde(default)]
    pub backend: BackendConfig,

    /// Session pool sizing and limits
    #[serde(default)]
    pub pool: PoolConfig,

    /// Monitoring and metrics
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend host
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Backend command port
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum concurrent backend sessions
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Checkout wait bound in seconds, 0 waits without bound
    #[serde(default)]
    pub checkout_timeout_secs: u64,

    /// Commands a session may run before it is retired, 0 disables the budget
    #[serde(default = "default_max_commands")]
    pub max_commands_per_session: u64,

    /// Cap on captured (non-streamed) response documents
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Enable the Prometheus text endpoint
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

// Default value functions
fn default_backend_host() -> String {
    "localhost".to_string()
}
fn default_backend_port() -> u16 {
    10022
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_capacity() -> usize {
    1
}
fn default_max_commands() -> u64 {
    2000
}
fn default_max_document_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_true() -> bool {
    true
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_backend_host(),
            port: default_backend_port(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            checkout_timeout_secs: 0,
            max_commands_per_session: default_max_commands(),
            max_document_bytes: default_max_document_bytes(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: default_true(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            pool: PoolConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl PoolConfig {
    /// `None` means wait without bound, matching the classic blocking
    /// checkout contract.
    pub fn checkout_timeout(&self) -> Option<Duration> {
        if self.checkout_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.checkout_timeout_secs))
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with `.env` and environment overrides applied.
    pub fn from_file_with_env(path: &str) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Backend endpoint overrides for deployments that cannot edit the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("DATAGATE_BACKEND_HOST") {
            if !host.is_empty() {
                self.backend.host = host;
            }
        }
        if let Ok(port) = std::env::var("DATAGATE_BACKEND_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.backend.port = port;
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend.host.is_empty() {
            anyhow::bail!("backend.host must not be empty");
        }
        if self.backend.port == 0 {
            anyhow::bail!("backend.port must not be 0");
        }
        if self.pool.capacity == 0 {
            anyhow::bail!("pool.capacity must be at least 1");
        }
        if self.pool.max_document_bytes == 0 {
            anyhow::bail!("pool.max_document_bytes must not be 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.pool.capacity, 1);
        assert_eq!(config.pool.max_commands_per_session, 2000);
        assert_eq!(config.pool.checkout_timeout(), None);
        assert_eq!(config.backend.connect_timeout(), Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [backend]
            host = "data-backend"
            port = 11002

            [pool]
            capacity = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.backend.host, "data-backend");
        assert_eq!(config.backend.port, 11002);
        assert_eq!(config.pool.capacity, 4);
        assert_eq!(config.pool.max_document_bytes, 16 * 1024 * 1024);
        assert!(config.monitoring.enable_metrics);
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.backend.host, "localhost");
        assert_eq!(config.pool.capacity, 1);
    }

    #[test]
    fn checkout_timeout_zero_means_unbounded() {
        let config: Config = toml::from_str(
            r#"
            [pool]
            checkout_timeout_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.checkout_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(PoolConfig::default().checkout_timeout(), None);
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.pool.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_replace_endpoint() {
        std::env::set_var("DATAGATE_BACKEND_HOST", "env-backend");
        std::env::set_var("DATAGATE_BACKEND_PORT", "12345");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.backend.host, "env-backend");
        assert_eq!(config.backend.port, 12345);
        std::env::remove_var("DATAGATE_BACKEND_HOST");
        std::env::remove_var("DATAGATE_BACKEND_PORT");
    }
}
