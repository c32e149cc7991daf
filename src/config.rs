//! Engine configuration
//!
//! Mirrors the `custom` section of a DataJoint `dj_local_conf.json`:
//!
//! ```json
//! {
//!     "custom": { "database.prefix": "lab_" },
//!     "lock_timeout_ms": 2000
//! }
//! ```
//!
//! Environment overrides: `ELEMENTDB_PREFIX`, `ELEMENTDB_LOCK_TIMEOUT_MS`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Prefix used when none is configured
pub const DEFAULT_DATABASE_PREFIX: &str = "datajoint-element_";

/// Bounded wait for schema and table locks
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variable overriding the database prefix
pub const PREFIX_ENV: &str = "ELEMENTDB_PREFIX";

/// Environment variable overriding the lock timeout, in milliseconds
pub const LOCK_TIMEOUT_ENV: &str = "ELEMENTDB_LOCK_TIMEOUT_MS";

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Prefix prepended to every schema namespace
    pub database_prefix: String,
    /// Bounded wait for schema and table locks
    pub lock_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_prefix: DEFAULT_DATABASE_PREFIX.to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    custom: HashMap<String, serde_json::Value>,
    #[serde(default)]
    lock_timeout_ms: Option<u64>,
}

impl Config {
    /// Parse a DataJoint-style JSON configuration.
    ///
    /// Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns error on malformed JSON or a non-string prefix.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(json)?;
        let mut config = Self::default();
        if let Some(prefix) = file.custom.get("database.prefix") {
            let prefix = prefix
                .as_str()
                .ok_or_else(|| Error::Config("`custom.database.prefix` must be a string".to_string()))?;
            config.database_prefix = prefix.to_string();
        }
        if let Some(ms) = file.lock_timeout_ms {
            config.lock_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Apply `ELEMENTDB_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns error if an override is malformed.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(prefix) = var(PREFIX_ENV) {
            self.database_prefix = prefix;
        }
        if let Some(ms) = var(LOCK_TIMEOUT_ENV) {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{LOCK_TIMEOUT_ENV} must be milliseconds, got `{ms}`")))?;
            self.lock_timeout = Duration::from_millis(ms);
        }
        self.validate()?;
        Ok(self)
    }

    /// Check the configuration, returning it unchanged.
    ///
    /// # Errors
    ///
    /// Returns `Config` for a zero lock timeout or a prefix containing
    /// whitespace or dots.
    pub fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.lock_timeout.is_zero() {
            return Err(Error::Config("lock timeout must be positive".to_string()));
        }
        if self.database_prefix.contains(char::is_whitespace) || self.database_prefix.contains('.') {
            return Err(Error::Config(format!(
                "database prefix `{}` must not contain whitespace or dots",
                self.database_prefix
            )));
        }
        Ok(())
    }
}
