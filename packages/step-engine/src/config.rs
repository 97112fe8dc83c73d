use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;

use crate::error::{EngineError, Result};

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_CACHE_HOURS: i64 = 24;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ENV_PREFIX: &str = "STEP_ENGINE";
pub const DEFAULT_RUNNER_CONCURRENCY: usize = 4;

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Work items per queued batch job
    pub batch_size: usize,
    /// Default freshness TTL for cached documents
    pub cache_hours: i64,
    /// Upper bound on a single external fetch
    pub fetch_timeout: Duration,
    /// Prefix for credential env lookups (`<PREFIX>_<NAME>`)
    pub env_prefix: String,
    pub runner_concurrency: usize,
    pub database_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            cache_hours: DEFAULT_CACHE_HOURS,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            runner_concurrency: DEFAULT_RUNNER_CONCURRENCY,
            database_url: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config = Self {
            batch_size: parse_or(&lookup, "STEP_ENGINE_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            cache_hours: parse_or(&lookup, "STEP_ENGINE_CACHE_HOURS", DEFAULT_CACHE_HOURS)?,
            fetch_timeout: Duration::from_secs(parse_or(
                &lookup,
                "STEP_ENGINE_FETCH_TIMEOUT_SECS",
                DEFAULT_FETCH_TIMEOUT_SECS,
            )?),
            env_prefix: lookup("STEP_ENGINE_ENV_PREFIX")
                .unwrap_or_else(|| DEFAULT_ENV_PREFIX.to_string()),
            runner_concurrency: parse_or(
                &lookup,
                "STEP_ENGINE_RUNNER_CONCURRENCY",
                DEFAULT_RUNNER_CONCURRENCY,
            )?,
            database_url: lookup("DATABASE_URL"),
        };

        if config.batch_size == 0 {
            return Err(EngineError::invalid_config(
                "engine",
                "STEP_ENGINE_BATCH_SIZE must be greater than 0",
            ));
        }
        Ok(config)
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            EngineError::invalid_config("engine", format!("{key} must be a valid number, got {raw:?}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.fetch_timeout, Duration::from_secs(30));
    }

    #[test]
    fn overrides_from_env() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("STEP_ENGINE_BATCH_SIZE", "250"),
            ("STEP_ENGINE_CACHE_HOURS", "0"),
            ("STEP_ENGINE_ENV_PREFIX", "QUAERO"),
            ("DATABASE_URL", "postgres://localhost/jobs"),
        ]))
        .unwrap();

        assert_eq!(config.batch_size, 250);
        assert_eq!(config.cache_hours, 0);
        assert_eq!(config.env_prefix, "QUAERO");
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/jobs"));
    }

    #[test]
    fn bad_numbers_are_configuration_errors() {
        let err = EngineConfig::from_lookup(lookup(&[("STEP_ENGINE_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("STEP_ENGINE_BATCH_SIZE"));

        let err = EngineConfig::from_lookup(lookup(&[("STEP_ENGINE_BATCH_SIZE", "0")])).unwrap_err();
        assert!(err.is_configuration());
    }
}
