// Configuration File Support
//
// Configuration file parsing for the lectern-quota CLI.
// Supports TOML format with environment variable overrides.
// The file is read from LECTERN_CONFIG, or ./lectern-quota.toml when unset.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::quota::GuardConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Quota guard configuration
    pub guard: GuardConfig,

    /// Ledger and user storage locations
    pub storage: StorageConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON-lines usage ledger
    pub ledger_path: PathBuf,

    /// JSON array of user records
    pub users_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from("./data/usage.jsonl"),
            users_path: PathBuf::from("./data/users.json"),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from_path(Self::config_path())
    }

    /// Load configuration from a specific path
    ///
    /// Missing files yield defaults (with environment overrides applied).
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Default configuration file path
    pub fn config_path() -> PathBuf {
        std::env::var("LECTERN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("lectern-quota.toml"))
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - LECTERN_LOG_LEVEL
    /// - LECTERN_LOG_FORMAT
    /// - LECTERN_LEDGER_PATH
    /// - LECTERN_USERS_PATH
    /// - the guard's own LECTERN_* overrides
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("LECTERN_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LECTERN_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(path) = std::env::var("LECTERN_LEDGER_PATH") {
            if !path.is_empty() {
                self.storage.ledger_path = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("LECTERN_USERS_PATH") {
            if !path.is_empty() {
                self.storage.users_path = PathBuf::from(path);
            }
        }

        self.guard = self.guard.apply_env_overrides();
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", self.logging.level),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!("Invalid log format: {}. Must be one of: json, pretty, compact", self.logging.format),
        }

        if self.storage.ledger_path.as_os_str().is_empty() {
            anyhow::bail!("Ledger path must not be empty");
        }

        self.guard
            .validate()
            .context("Invalid quota guard configuration")?;

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging.level.to_lowercase().parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}
