//! Configuration management for the Dockbridge daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/dockbridge/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("connect_timeout_secs must be between 1 and 300, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("idle_timeout_secs must be between 1 and 86400, got {0}")]
    InvalidIdleTimeout(u64),

    #[error("listen address is not valid: {0}")]
    InvalidListenAddr(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Dockbridge daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP server configuration.
    pub server: ServerConfig,

    /// Container-runtime connection configuration.
    pub docker: DockerConfig,

    /// Session management configuration.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data (host store, logs).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server listens on.
    pub listen: String,
}

/// Container-runtime connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DockerConfig {
    /// Bound on establishing a connection to a daemon, in seconds.
    pub connect_timeout_secs: u64,

    /// How long an unused transport may stay open, in seconds.
    pub idle_timeout_secs: u64,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of concurrent sessions across all hosts.
    pub max_sessions: usize,

    /// Interval for the background sweeps (sessions and idle transports),
    /// in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7180".to_string(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            idle_timeout_secs: 90,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            sweep_interval_secs: 60,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dockbridge")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dockbridge")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - DOCKBRIDGE_LISTEN: Override the server listen address
    /// - DOCKBRIDGE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("DOCKBRIDGE_LISTEN") {
            if !listen.is_empty() {
                tracing::info!("Overriding listen address from environment: {}", listen);
                self.server.listen = listen;
            }
        }
        if let Ok(level) = std::env::var("DOCKBRIDGE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.session.max_sessions == 0 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }
        if self.docker.connect_timeout_secs == 0 || self.docker.connect_timeout_secs > 300 {
            return Err(ConfigError::InvalidConnectTimeout(
                self.docker.connect_timeout_secs,
            ));
        }
        if self.docker.idle_timeout_secs == 0 || self.docker.idle_timeout_secs > 86400 {
            return Err(ConfigError::InvalidIdleTimeout(
                self.docker.idle_timeout_secs,
            ));
        }
        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(self.server.listen.clone()));
        }
        if !VALID_LOG_LEVELS.contains(&self.daemon.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }
        Ok(())
    }

    /// Loads configuration from the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        Ok(config)
    }

    /// Loads configuration from the default path, or returns defaults if
    /// no file exists there.
    pub fn load_or_default() -> Result<Self> {
        Self::load_or_default_from(&default_config_path())
    }

    /// Loads configuration from `path`, or returns defaults if it does not
    /// exist.
    pub fn load_or_default_from(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Saves the configuration to the given path.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path, text)
            .with_context(|| format!("failed to write config at {}", path.display()))?;
        Ok(())
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.docker.connect_timeout_secs)
    }

    /// Transport idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.docker.idle_timeout_secs)
    }

    /// Background sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session.sweep_interval_secs)
    }
}
