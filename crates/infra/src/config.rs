//! Process configuration read from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `JOBRELAY_MAX_RUN_SECS` | `14400` |
//! | `JOBRELAY_POP_TIMEOUT_MS` | `5000` |
//! | `JOBRELAY_IDLE_DELAY_MS` | `1000` (never lower) |
//! | `JOBRELAY_WORKER_NAME` | `worker-<uuid>` |
//! | `JOBRELAY_MAX_ATTEMPTS` | `25` |
//! | `JOBRELAY_STREAM_PREFIX` | `jobrelay:notifications` |
//! | `REDIS_URL` | `redis://localhost:6379` |
//! | `DATABASE_URL` | unset |

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use jobrelay_core::RetryPolicy;

use crate::reservation::{MIN_IDLE_DELAY, ReservationConfig};

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_STREAM_PREFIX: &str = "jobrelay:notifications";

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub worker_name: String,
    pub max_run_duration: chrono::Duration,
    pub pop_timeout: Duration,
    pub idle_delay: Duration,
    pub max_attempts: u32,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub stream_prefix: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            worker_name: default_worker_name(),
            max_run_duration: chrono::Duration::hours(4),
            pop_timeout: Duration::from_secs(5),
            idle_delay: MIN_IDLE_DELAY,
            max_attempts: RetryPolicy::default().max_attempts,
            database_url: None,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source. Invalid numbers fall back to the
    /// default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let max_run_secs: i64 = parse_or(
            &lookup,
            "JOBRELAY_MAX_RUN_SECS",
            defaults.max_run_duration.num_seconds(),
        );
        let pop_ms: u64 = parse_or(
            &lookup,
            "JOBRELAY_POP_TIMEOUT_MS",
            defaults.pop_timeout.as_millis() as u64,
        );
        let idle_ms: u64 = parse_or(
            &lookup,
            "JOBRELAY_IDLE_DELAY_MS",
            defaults.idle_delay.as_millis() as u64,
        );

        Self {
            worker_name: lookup("JOBRELAY_WORKER_NAME")
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(defaults.worker_name),
            max_run_duration: max_run_duration(max_run_secs, defaults.max_run_duration),
            pop_timeout: Duration::from_millis(pop_ms),
            idle_delay: Duration::from_millis(idle_ms).max(MIN_IDLE_DELAY),
            max_attempts: parse_or(&lookup, "JOBRELAY_MAX_ATTEMPTS", defaults.max_attempts),
            database_url: lookup("DATABASE_URL"),
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_prefix: lookup("JOBRELAY_STREAM_PREFIX").unwrap_or(defaults.stream_prefix),
        }
    }

    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn with_max_run_duration(mut self, max_run: chrono::Duration) -> Self {
        self.max_run_duration = max_run;
        self
    }

    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    pub fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay.max(MIN_IDLE_DELAY);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn reservation(&self) -> ReservationConfig {
        ReservationConfig::default()
            .with_max_run_duration(self.max_run_duration)
            .with_pop_wait(self.pop_timeout)
            .with_idle_delay(self.idle_delay)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_attempts(self.max_attempts)
    }
}

fn default_worker_name() -> String {
    format!("worker-{}", uuid::Uuid::now_v7())
}

fn max_run_duration(secs: i64, default: chrono::Duration) -> chrono::Duration {
    chrono::Duration::try_seconds(secs.max(1)).unwrap_or_else(|| {
        warn!(
            key = "JOBRELAY_MAX_RUN_SECS",
            value = secs,
            "configuration value out of range, using default"
        );
        default
    })
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "invalid configuration value, using default");
            default
        }),
    }
}
