//! Configuration for family-points

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::families::FamilyPolicy;
use crate::error::LedgerError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("family-points")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the ledger database and config file
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// How long a writer waits on SQLite's write lock before giving up
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Attempts for operations failing with a transient storage error
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// First retry delay, doubled on each further attempt
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// JWT secret (required unless running in dev mode)
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// JWT token expiry in seconds
    #[serde(default = "default_jwt_expiry")]
    pub jwt_expiry_seconds: u64,

    /// Development mode: fixed insecure JWT secret
    #[serde(default)]
    pub dev_mode: bool,

    /// Policy copied into every newly created family
    #[serde(default)]
    pub default_policy: FamilyPolicy,
}

fn default_http_port() -> u16 {
    8095
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    50
}

fn default_jwt_expiry() -> u64 {
    3600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            http_port: default_http_port(),
            busy_timeout_ms: default_busy_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            jwt_secret: None,
            jwt_expiry_seconds: default_jwt_expiry(),
            dev_mode: false,
            default_policy: FamilyPolicy::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get ledger database path
    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join("ledger.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), LedgerError> {
        if !self.dev_mode && self.jwt_secret.as_deref().map_or(true, str::is_empty) {
            return Err(LedgerError::Config(
                "JWT_SECRET is required unless dev mode is enabled".to_string(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(LedgerError::Config("retry_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}
