//! Queue configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskforge_core::RetryPolicy;
use thiserror::Error;

pub const DEFAULT_KEY_PREFIX: &str = "taskforge";
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything a queue instance needs to know about its environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Namespace for every store key and broadcast channel.
    pub key_prefix: String,
    pub redis_url: String,
    /// Upper bound on the In-Flight Set while dispatching.
    pub max_concurrent_jobs: usize,
    /// Dispatcher tick interval.
    pub poll_interval: Duration,
    /// Handler retry policy; `max_attempts` is the default per-job limit.
    pub retry: RetryPolicy,
    /// File exhausted jobs under the dead-letter lane instead of the plain failed lane.
    pub dead_letter_enabled: bool,
    /// How long `close()` waits for running handlers.
    pub shutdown_timeout: Duration,
    /// Broadcast transport reconnect policy.
    pub reconnect: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            max_concurrent_jobs: 5,
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(300)),
            dead_letter_enabled: true,
            shutdown_timeout: Duration::from_secs(30),
            reconnect: RetryPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(30)),
        }
    }
}

impl QueueConfig {
    /// Read `TASKFORGE_*` / `REDIS_URL` from the process environment, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`QueueConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(prefix) = lookup("TASKFORGE_KEY_PREFIX") {
            if prefix.trim().is_empty() {
                return Err(invalid("TASKFORGE_KEY_PREFIX", prefix, "must not be empty"));
            }
            config.key_prefix = prefix;
        }
        if let Some(url) = lookup("REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(n) = parse::<usize>(&lookup, "TASKFORGE_MAX_CONCURRENT_JOBS")? {
            if n == 0 {
                return Err(invalid("TASKFORGE_MAX_CONCURRENT_JOBS", n.to_string(), "must be at least 1"));
            }
            config.max_concurrent_jobs = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "TASKFORGE_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(n) = parse::<u32>(&lookup, "TASKFORGE_RETRY_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "TASKFORGE_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(flag) = parse::<bool>(&lookup, "TASKFORGE_DEAD_LETTER")? {
            config.dead_letter_enabled = flag;
        }
        if let Some(ms) = parse::<u64>(&lookup, "TASKFORGE_SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry.max_attempts = attempts;
        self
    }

    pub fn with_dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter_enabled = enabled;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

fn invalid(var: &'static str, value: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.into(),
        reason: reason.into(),
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(var, raw.clone(), e.to_string())),
    }
}
