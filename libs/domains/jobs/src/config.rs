//! Per-domain listing configuration.

use core_config::{ConfigError, env_parse};
use std::time::Duration;

/// Chunk/page bounds and cache TTL of one listing domain.
///
/// Loaded with a domain prefix, e.g. `COMPANY_LIST_MAX_CHUNK_SIZE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingConfig {
    pub default_chunk_size: u64,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub default_page_size: u64,
    pub min_page_size: u64,
    pub max_page_size: u64,
    /// TTL of the job's meta and data keys
    pub ttl: Duration,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 1000,
            min_chunk_size: 200,
            max_chunk_size: 5000,
            default_page_size: 50,
            min_page_size: 1,
            max_page_size: 500,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl ListingConfig {
    /// Load `{prefix}*` variables over the built-in defaults.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_env_with_defaults(prefix, Self::default())
    }

    /// Load `{prefix}*` variables over domain-specific defaults.
    pub fn from_env_with_defaults(prefix: &str, defaults: Self) -> Result<Self, ConfigError> {
        let key = |name: &str| format!("{prefix}{name}");

        let config = Self {
            default_chunk_size: env_parse(&key("DEFAULT_CHUNK_SIZE"), defaults.default_chunk_size)?,
            min_chunk_size: env_parse(&key("MIN_CHUNK_SIZE"), defaults.min_chunk_size)?,
            max_chunk_size: env_parse(&key("MAX_CHUNK_SIZE"), defaults.max_chunk_size)?,
            default_page_size: env_parse(&key("DEFAULT_PAGE_SIZE"), defaults.default_page_size)?,
            min_page_size: env_parse(&key("MIN_PAGE_SIZE"), defaults.min_page_size)?,
            max_page_size: env_parse(&key("MAX_PAGE_SIZE"), defaults.max_page_size)?,
            ttl: Duration::from_secs(env_parse(&key("REDIS_TTL_SECONDS"), defaults.ttl.as_secs())?),
        };
        config.validate(prefix)?;
        Ok(config)
    }

    pub fn validate(&self, prefix: &str) -> Result<(), ConfigError> {
        let invalid = |name: &str, details: String| ConfigError::Invalid {
            key: format!("{prefix}{name}"),
            details,
        };

        check_bounds(self.min_chunk_size, self.default_chunk_size, self.max_chunk_size)
            .map_err(|details| invalid("CHUNK_SIZE", details))?;
        check_bounds(self.min_page_size, self.default_page_size, self.max_page_size)
            .map_err(|details| invalid("PAGE_SIZE", details))?;

        if self.ttl.is_zero() {
            return Err(invalid("REDIS_TTL_SECONDS", "must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// `clamp(requested ?? default, min, max)`. Out-of-range input is
    /// clamped, never rejected.
    pub fn normalize_chunk_size(&self, requested: Option<i64>) -> u64 {
        clamp(requested, self.default_chunk_size, self.min_chunk_size, self.max_chunk_size)
    }

    pub fn normalize_page_size(&self, requested: Option<i64>) -> u64 {
        clamp(requested, self.default_page_size, self.min_page_size, self.max_page_size)
    }
}

fn clamp(requested: Option<i64>, default: u64, min: u64, max: u64) -> u64 {
    match requested {
        None => default.clamp(min, max),
        Some(value) if value <= 0 => min,
        Some(value) => (value as u64).clamp(min, max),
    }
}

fn check_bounds(min: u64, default: u64, max: u64) -> Result<(), String> {
    if min == 0 {
        return Err("minimum must be greater than zero".to_string());
    }
    if min > default || default > max {
        return Err(format!("expected min <= default <= max, got {min} / {default} / {max}"));
    }
    Ok(())
}
