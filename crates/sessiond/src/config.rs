//! Configuration management for the session daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/sessiond/config.toml`.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionSettings;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind_addr must be a socket address like 127.0.0.1:4000, got {0}")]
    InvalidBindAddr(String),

    #[error("ttl_secs must be at least 1, got {0}")]
    InvalidTtl(u64),

    #[error("gc_interval_secs must be at least 1, got {0}")]
    InvalidGcInterval(u64),

    #[error("send_timeout_ms must be between 1 and 60000, got {0}")]
    InvalidSendTimeout(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("initial session keys must not be empty")]
    EmptySessionKey,

    #[error("initial session key listed twice: {0}")]
    DuplicateSessionKey(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the session daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// WebSocket listener configuration.
    pub server: ServerConfig,

    /// Session registry configuration.
    pub sessions: SessionsConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket server binds to.
    pub bind_addr: String,
}

/// Session registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionsConfig {
    /// Keys registered at startup.
    pub initial: Vec<String>,

    /// Idle time in seconds after which a session is evicted.
    pub ttl_secs: u64,

    /// Seconds between garbage collection sweeps.
    pub gc_interval_secs: u64,

    /// Bound in milliseconds on a single member send during broadcast.
    pub send_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4000".to_string(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            initial: Vec::new(),
            ttl_secs: 30 * 60,
            gc_interval_secs: 60,
            send_timeout_ms: 5000,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sessiond")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SESSIOND_BIND_ADDR: Override the listen address
    /// - SESSIOND_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SESSIOND_BIND_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding bind_addr from environment: {}", addr);
                self.server.bind_addr = addr;
            }
        }

        if let Ok(level) = std::env::var("SESSIOND_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;

        if self.sessions.ttl_secs < 1 {
            return Err(ConfigError::InvalidTtl(self.sessions.ttl_secs));
        }

        if self.sessions.gc_interval_secs < 1 {
            return Err(ConfigError::InvalidGcInterval(self.sessions.gc_interval_secs));
        }

        let timeout = self.sessions.send_timeout_ms;
        if !(1..=60_000).contains(&timeout) {
            return Err(ConfigError::InvalidSendTimeout(timeout));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        let mut seen = HashSet::new();
        for key in &self.sessions.initial {
            if key.is_empty() {
                return Err(ConfigError::EmptySessionKey);
            }
            if !seen.insert(key.as_str()) {
                return Err(ConfigError::DuplicateSessionKey(key.clone()));
            }
        }

        Ok(())
    }

    /// Parses the configured listen address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind_addr
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddr(self.server.bind_addr.clone()))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            ttl: Duration::from_secs(config.sessions.ttl_secs),
            gc_interval: Duration::from_secs(config.sessions.gc_interval_secs),
            send_timeout: Duration::from_millis(config.sessions.send_timeout_ms),
        }
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
