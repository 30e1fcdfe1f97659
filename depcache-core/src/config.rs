//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CacheResult, ConfigError};

/// How misuse of scope declarations is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Misuse raises [`ConfigError`] immediately.
    #[default]
    Development,
    /// Misuse is logged and tolerated; affected entries fall back to the
    /// scope catch-all dependency so they are still invalidated.
    Production,
}

impl ValidationMode {
    /// True when misuse is tolerated rather than raised.
    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Prefix of every backend key written by the cache.
    pub key_prefix: String,
    /// TTL applied by `put` when the caller passes none. `None` means
    /// entries never expire.
    pub default_ttl_secs: Option<u64>,
    /// Scope misuse reporting.
    pub validation_mode: ValidationMode,
    /// Log every invalidation sweep at `info` level.
    pub log_invalidations: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "cache".to_string(),
            default_ttl_secs: None,
            validation_mode: ValidationMode::Development,
            log_invalidations: false,
        }
    }
}

impl CacheConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backend key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_secs = Some(ttl.as_secs());
        self
    }

    /// Set the validation mode.
    pub fn with_validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }

    /// Enable or disable invalidation logging.
    pub fn with_log_invalidations(mut self, enabled: bool) -> Self {
        self.log_invalidations = enabled;
        self
    }

    /// Default TTL as a [`Duration`].
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> CacheResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - key_prefix is non-empty and does not contain the `::` separator
    /// - default_ttl_secs is positive when present
    pub fn validate(&self) -> CacheResult<()> {
        validate_key_prefix(&self.key_prefix)?;

        if self.default_ttl_secs == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "default_ttl_secs".to_string(),
                value: "0".to_string(),
                reason: "default_ttl_secs must be positive".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

/// A key prefix must be non-empty and free of the `::` key separator.
pub fn validate_key_prefix(prefix: &str) -> CacheResult<()> {
    if prefix.is_empty() || prefix.contains("::") {
        return Err(ConfigError::InvalidValue {
            field: "key_prefix".to_string(),
            value: prefix.to_string(),
            reason: "key_prefix must be non-empty and must not contain '::'".to_string(),
        }
        .into());
    }
    Ok(())
}
