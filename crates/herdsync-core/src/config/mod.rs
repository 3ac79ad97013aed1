//! Sync engine configuration.
//!
//! `SyncConfig::default()` carries the production defaults; `from_env` lets
//! a host process override them with `HERDSYNC_*` variables.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::util::{has_http_scheme, trimmed_non_empty};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Exponential backoff with jitter
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    /// Fraction of the delay added or removed at random, e.g. `0.2` for ±20%
    pub jitter: f64,
    /// Seed for the jitter RNG; fixed seeds make schedules reproducible
    pub seed: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(5 * 60),
            jitter: 0.2,
            seed: 0x5eed,
        }
    }
}

/// Runtime configuration for the sync engine
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Local store file; `None` keeps everything in memory
    pub database_path: Option<PathBuf>,
    /// Base URL of the remote upsert API
    pub api_base_url: Option<String>,
    /// Byte budget of the local store
    pub quota_bytes: u64,
    /// Size of the worker pool
    pub workers: usize,
    /// Delivery attempts before an entry is parked
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    /// Deadline for a single remote call
    pub request_timeout: Duration,
    /// How long shutdown waits for in-flight calls
    pub shutdown_grace: Duration,
    /// How long tombstones block writes to a deleted id
    pub tombstone_ttl: Duration,
    /// Longest a worker sleeps without re-checking the queue
    pub idle_poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            api_base_url: None,
            quota_bytes: 50 * 1024 * 1024,
            workers: 4,
            max_attempts: 8,
            backoff: BackoffConfig::default(),
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            tombstone_ttl: Duration::from_secs(24 * 60 * 60),
            idle_poll_interval: Duration::from_secs(5),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_path = optional_trimmed(&lookup, "HERDSYNC_DATABASE_PATH").map(PathBuf::from);

        let api_base_url = optional_trimmed(&lookup, "HERDSYNC_API_BASE_URL")
            .map(|value| value.trim_end_matches('/').to_string());
        if let Some(url) = api_base_url.as_deref() {
            if !has_http_scheme(url) {
                return Err(ConfigError::Invalid(
                    "HERDSYNC_API_BASE_URL must start with http:// or https://".to_string(),
                ));
            }
        }

        let quota_bytes = parse_in_range(
            &lookup,
            "HERDSYNC_QUOTA_BYTES",
            defaults.quota_bytes,
            1_024..=u64::MAX,
        )?;
        let workers = parse_in_range(&lookup, "HERDSYNC_WORKERS", defaults.workers, 1..=64)?;
        let max_attempts = parse_in_range(
            &lookup,
            "HERDSYNC_MAX_ATTEMPTS",
            defaults.max_attempts,
            1..=100,
        )?;

        let base_ms = parse_in_range(
            &lookup,
            "HERDSYNC_BACKOFF_BASE_MS",
            duration_ms(defaults.backoff.base),
            1..=600_000,
        )?;
        let cap_ms = parse_in_range(
            &lookup,
            "HERDSYNC_BACKOFF_CAP_MS",
            duration_ms(defaults.backoff.cap),
            1..=86_400_000,
        )?;
        if cap_ms < base_ms {
            return Err(ConfigError::Invalid(
                "HERDSYNC_BACKOFF_CAP_MS must be >= HERDSYNC_BACKOFF_BASE_MS".to_string(),
            ));
        }
        let seed = parse_in_range(
            &lookup,
            "HERDSYNC_BACKOFF_SEED",
            defaults.backoff.seed,
            0..=u64::MAX,
        )?;

        let request_timeout_secs = parse_in_range(
            &lookup,
            "HERDSYNC_REQUEST_TIMEOUT_SECS",
            defaults.request_timeout.as_secs(),
            1..=600,
        )?;
        let shutdown_grace_secs = parse_in_range(
            &lookup,
            "HERDSYNC_SHUTDOWN_GRACE_SECS",
            defaults.shutdown_grace.as_secs(),
            0..=300,
        )?;
        let tombstone_ttl_secs = parse_in_range(
            &lookup,
            "HERDSYNC_TOMBSTONE_TTL_SECS",
            defaults.tombstone_ttl.as_secs(),
            0..=30 * 86_400,
        )?;

        Ok(Self {
            database_path,
            api_base_url,
            quota_bytes,
            workers,
            max_attempts,
            backoff: BackoffConfig {
                base: Duration::from_millis(base_ms),
                cap: Duration::from_millis(cap_ms),
                seed,
                ..defaults.backoff
            },
            request_timeout: Duration::from_secs(request_timeout_secs),
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
            tombstone_ttl: Duration::from_secs(tombstone_ttl_secs),
            idle_poll_interval: defaults.idle_poll_interval,
        })
    }

    /// Base URL or an error naming the variable that provides it
    pub fn require_api_base_url(&self) -> Result<&str, ConfigError> {
        self.api_base_url
            .as_deref()
            .ok_or(ConfigError::MissingVar("HERDSYNC_API_BASE_URL"))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_in_range<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    range: std::ops::RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
{
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<T>().map_err(|_| {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    })?;
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{}, {}]",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    trimmed_non_empty(lookup(name))
}
