//! Configuration module.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Server settings (port, bind address)
//! - Plugin settings (executable path, invocation budgets)
//! - Scheduler tick, polling pool and discovery pool sizing
//! - Result archive directory

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::poller::PollerConfig;
use crate::poller::plugin::PluginConfig;
use crate::prober::ProberConfig;
use crate::scheduler::SchedulerConfig;
use crate::sink::ArchiveConfig;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    Validation(String),
}

/// Web server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8080).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server configuration.
    pub server: ServerConfig,

    /// Probing executable configuration.
    pub plugin: PluginConfig,

    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,

    /// Poll executor configuration.
    pub poller: PollerConfig,

    /// Discovery pipeline configuration.
    pub discovery: ProberConfig,

    /// Result archive configuration.
    pub archive: ArchiveConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::Validation(format!(
                "invalid server bind address: '{}'",
                self.server.bind
            ))
        })?;
        if self.server.port == 0 {
            return Err(ConfigError::Validation(
                "server port must be non-zero".to_string(),
            ));
        }

        if self.plugin.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "plugin path must be set".to_string(),
            ));
        }
        if self.plugin.poll_timeout.is_zero() || self.plugin.discover_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "plugin timeouts must be positive".to_string(),
            ));
        }

        if self.scheduler.tick.is_zero() {
            return Err(ConfigError::Validation(
                "scheduler tick must be positive".to_string(),
            ));
        }

        if self.poller.workers == 0 {
            return Err(ConfigError::Validation(
                "poller workers must be positive".to_string(),
            ));
        }
        if self.poller.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "poller queue_capacity must be positive".to_string(),
            ));
        }

        if self.discovery.workers == 0 {
            return Err(ConfigError::Validation(
                "discovery workers must be positive".to_string(),
            ));
        }
        if self.discovery.ping_packets == 0 {
            return Err(ConfigError::Validation(
                "discovery ping_packets must be positive".to_string(),
            ));
        }

        if self.archive.directory.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "archive directory must be set".to_string(),
            ));
        }

        Ok(())
    }
}
