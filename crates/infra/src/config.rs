//! Process configuration from `STOREFRONT_*` environment variables.
//!
//! | Variable                       | Default                  |
//! |--------------------------------|--------------------------|
//! | `STOREFRONT_BACKEND`           | `memory` (or `redis`)    |
//! | `STOREFRONT_REDIS_URL`         | `redis://127.0.0.1:6379` |
//! | `STOREFRONT_DATABASE_URL`      | unset (in-memory store)  |
//! | `STOREFRONT_MAX_ATTEMPTS`      | `3`                      |
//! | `STOREFRONT_BACKOFF`           | `exponential`            |
//! | `STOREFRONT_BACKOFF_DELAY_MS`  | `1000`                   |
//! | `STOREFRONT_BACKOFF_MAX_MS`    | `60000`                  |
//! | `STOREFRONT_STALL_TIMEOUT_MS`  | `30000`                  |
//! | `STOREFRONT_MAX_STALLED_COUNT` | `1`                      |
//! | `STOREFRONT_CONCURRENCY`       | `1`                      |
//! | `STOREFRONT_POLL_INTERVAL_MS`  | `100`                    |
//! | `STOREFRONT_LOG_FORMAT`        | `json`                   |

use std::str::FromStr;
use std::time::Duration;

use crate::jobs::{BackoffStrategy, QueuePolicy, RetryPolicy, WorkerConfig};

const PREFIX: &str = "STOREFRONT_";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

/// Where queues and the cache live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Memory,
    Redis,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Backend::Memory),
            "redis" => Ok(Backend::Redis),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorefrontConfig {
    pub backend: Backend,
    pub redis_url: String,
    pub database_url: Option<String>,
    pub policy: QueuePolicy,
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Passed through to the logging setup (`json` or `pretty`).
    pub log_format: String,
}

impl Default for StorefrontConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database_url: None,
            policy: QueuePolicy::default(),
            concurrency: 1,
            poll_interval: Duration::from_millis(100),
            log_format: "json".to_string(),
        }
    }
}

impl StorefrontConfig {
    /// Load from the process environment, reading `.env` first when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using `lookup` to resolve full variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            let name = format!("{PREFIX}{suffix}");
            let value = lookup(&name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
            (name, value)
        };

        let defaults = Self::default();
        let retry_defaults = defaults.policy.retry.clone();

        let backend = parse_or(var("BACKEND"), defaults.backend)?;
        let redis_url = var("REDIS_URL").1.unwrap_or(defaults.redis_url);
        let database_url = var("DATABASE_URL").1;

        let max_attempts: u32 = parse_or(var("MAX_ATTEMPTS"), retry_defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(invalid("STOREFRONT_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        let strategy: BackoffStrategy = parse_or(var("BACKOFF"), retry_defaults.strategy)?;
        let base_delay = millis_or(var("BACKOFF_DELAY_MS"), retry_defaults.base_delay)?;
        let max_delay = millis_or(var("BACKOFF_MAX_MS"), retry_defaults.max_delay)?.max(base_delay);

        let stall_timeout = millis_or(var("STALL_TIMEOUT_MS"), defaults.policy.stall_timeout)?;
        if stall_timeout.is_zero() {
            return Err(invalid("STOREFRONT_STALL_TIMEOUT_MS", "0", "must be positive"));
        }
        let max_stalled_count = parse_or(var("MAX_STALLED_COUNT"), defaults.policy.max_stalled_count)?;

        let concurrency: usize = parse_or(var("CONCURRENCY"), defaults.concurrency)?;
        if concurrency == 0 {
            return Err(invalid("STOREFRONT_CONCURRENCY", "0", "must be at least 1"));
        }
        let poll_interval = millis_or(var("POLL_INTERVAL_MS"), defaults.poll_interval)?;
        let log_format = var("LOG_FORMAT").1.unwrap_or(defaults.log_format);

        Ok(Self {
            backend,
            redis_url,
            database_url,
            policy: QueuePolicy {
                retry: RetryPolicy {
                    max_attempts,
                    base_delay,
                    max_delay,
                    strategy,
                },
                stall_timeout,
                max_stalled_count,
            },
            concurrency,
            poll_interval,
            log_format,
        })
    }

    pub fn queue_policy(&self) -> QueuePolicy {
        self.policy.clone()
    }

    /// Runtime settings for a worker named `name`.
    pub fn worker_config(&self, name: impl Into<String>) -> WorkerConfig {
        WorkerConfig::default()
            .with_name(name)
            .with_concurrency(self.concurrency)
            .with_poll_interval(self.poll_interval)
    }
}

fn invalid(name: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_or<T>((name, value): (String, Option<String>), default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| invalid(&name, &raw, e.to_string())),
    }
}

fn millis_or(var: (String, Option<String>), default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(var, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<StorefrontConfig, ConfigError> {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("STOREFRONT_{k}"), v.to_string()))
            .collect();
        StorefrontConfig::from_lookup(|name| env.get(name).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config, StorefrontConfig::default());
        assert_eq!(config.policy.retry.max_attempts, 3);
        assert_eq!(config.policy.max_stalled_count, 1);
        assert_eq!(config.policy.stall_timeout, Duration::from_secs(30));
    }

    #[test]
    fn reads_queue_and_worker_settings() {
        let config = load(&[
            ("BACKEND", "redis"),
            ("REDIS_URL", "redis://cache:6379"),
            ("DATABASE_URL", "postgres://localhost/storefront"),
            ("MAX_ATTEMPTS", "5"),
            ("BACKOFF", "fixed"),
            ("BACKOFF_DELAY_MS", "250"),
            ("STALL_TIMEOUT_MS", "5000"),
            ("MAX_STALLED_COUNT", "2"),
            ("CONCURRENCY", "4"),
            ("POLL_INTERVAL_MS", "20"),
            ("LOG_FORMAT", "pretty"),
        ])
        .unwrap();

        assert_eq!(config.backend, Backend::Redis);
        assert_eq!(config.redis_url, "redis://cache:6379");
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/storefront"));
        assert_eq!(config.policy.retry.max_attempts, 5);
        assert_eq!(config.policy.retry.strategy, BackoffStrategy::Fixed);
        assert_eq!(config.policy.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.policy.stall_timeout, Duration::from_secs(5));
        assert_eq!(config.policy.max_stalled_count, 2);
        assert_eq!(config.log_format, "pretty");

        let worker = config.worker_config("productQueue");
        assert_eq!(worker.name, "productQueue");
        assert_eq!(worker.concurrency, 4);
        assert_eq!(worker.poll_interval, Duration::from_millis(20));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("DATABASE_URL", "  "), ("MAX_ATTEMPTS", "")]).unwrap();

        assert!(config.database_url.is_none());
        assert_eq!(config.policy.retry.max_attempts, 3);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = load(&[("MAX_ATTEMPTS", "lots")]).unwrap_err();
        assert!(err.to_string().contains("STOREFRONT_MAX_ATTEMPTS"));

        assert!(load(&[("BACKEND", "sqlite")]).is_err());
        assert!(load(&[("BACKOFF", "linear")]).is_err());
        assert!(load(&[("CONCURRENCY", "0")]).is_err());
        assert!(load(&[("STALL_TIMEOUT_MS", "0")]).is_err());
    }
}
