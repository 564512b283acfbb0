//! Configuration types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::ratelimit::{ENQUEUE_JOB, JOIN_THREAD, REGISTER_WORKER, START_THREAD};

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

/// Scheduler tunables. Passed into the dispatcher at construction.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long a claimed job may go without a heartbeat before its janitor fires.
    pub dead_timeout: Duration,
    /// How often workers are expected to heartbeat. Must be shorter than `dead_timeout`.
    pub heartbeat_interval: Duration,
    /// How often the dead-job sweep runs.
    pub sweep_interval: Duration,
    /// Age of `last_update_at` after which the sweep reclaims an in-progress job.
    pub dead_threshold: Duration,
    /// Maximum number of re-enqueues after a reported failure.
    pub max_retries: u32,
    /// Chance that a worker is handed a job for a target it already failed.
    pub retry_same_worker_probability: f64,
    /// Upper bound on jobs reclaimed by a single sweep.
    pub sweep_batch: usize,
    /// Named rate limiters.
    pub rate_limits: RateLimitsConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dead_timeout: 60 * SECOND,
            heartbeat_interval: 20 * SECOND,
            sweep_interval: 60 * SECOND,
            dead_threshold: 30 * SECOND,
            max_retries: 3,
            retry_same_worker_probability: 0.1,
            sweep_batch: 1000,
            rate_limits: RateLimitsConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Reject combinations that would make healthy workers look dead.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval >= self.dead_timeout {
            return Err(ConfigError::InvalidValue {
                key: "heartbeat_interval".into(),
                message: format!(
                    "{:?} must be shorter than dead_timeout {:?}",
                    self.heartbeat_interval, self.dead_timeout
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.retry_same_worker_probability) {
            return Err(ConfigError::InvalidValue {
                key: "retry_same_worker_probability".into(),
                message: format!("{} is not within 0..=1", self.retry_same_worker_probability),
            });
        }
        if self.sweep_batch == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sweep_batch".into(),
                message: "must be at least 1".into(),
            });
        }
        for (name, limiter) in &self.rate_limits.limiters {
            limiter.validate(name)?;
        }
        Ok(())
    }
}

/// Refill model of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterKind {
    /// Units refill continuously at `rate / period`.
    TokenBucket,
    /// Units refill in whole-period steps of `rate`.
    SlidingCounter,
}

/// Settings for one named limiter.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub kind: LimiterKind,
    /// Units added per `period`.
    pub rate: u32,
    pub period: Duration,
    /// Maximum stored units. Defaults to `rate`.
    pub capacity: Option<u32>,
    /// Largest deficit a caller may reserve ahead of time. `None` disables reservation.
    pub max_reserved: Option<u32>,
}

impl LimiterConfig {
    pub fn token_bucket(rate: u32, period: Duration) -> Self {
        Self {
            kind: LimiterKind::TokenBucket,
            rate,
            period,
            capacity: None,
            max_reserved: None,
        }
    }

    pub fn sliding_counter(rate: u32, period: Duration) -> Self {
        Self {
            kind: LimiterKind::SlidingCounter,
            ..Self::token_bucket(rate, period)
        }
    }

    /// Builder: set capacity.
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Builder: allow reservations up to `max_reserved` units.
    pub fn with_max_reserved(mut self, max_reserved: u32) -> Self {
        self.max_reserved = Some(max_reserved);
        self
    }

    pub fn capacity(&self) -> u32 {
        self.capacity.unwrap_or(self.rate)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.rate == 0 || self.period.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: format!("rate_limits.{name}"),
                message: "rate and period must be non-zero".into(),
            });
        }
        if self.capacity() == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("rate_limits.{name}.capacity"),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// All named limiters, keyed by limiter name.
#[derive(Debug, Clone)]
pub struct RateLimitsConfig {
    pub limiters: HashMap<String, LimiterConfig>,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        let mut limiters = HashMap::new();
        limiters.insert(
            ENQUEUE_JOB.to_string(),
            LimiterConfig::token_bucket(10, MINUTE).with_capacity(3),
        );
        limiters.insert(
            START_THREAD.to_string(),
            LimiterConfig::token_bucket(1, MINUTE).with_capacity(2),
        );
        limiters.insert(
            JOIN_THREAD.to_string(),
            LimiterConfig::token_bucket(1, SECOND),
        );
        limiters.insert(
            REGISTER_WORKER.to_string(),
            LimiterConfig::token_bucket(5, MINUTE),
        );
        Self { limiters }
    }
}

impl RateLimitsConfig {
    pub fn get(&self, name: &str) -> Result<&LimiterConfig, ConfigError> {
        self.limiters
            .get(name)
            .ok_or_else(|| ConfigError::UnknownLimiter(name.to_string()))
    }

    /// Builder: add or replace a limiter.
    pub fn with(mut self, name: impl Into<String>, limiter: LimiterConfig) -> Self {
        self.limiters.insert(name.into(), limiter);
        self
    }
}

/// Coordinator process configuration, read from `LLM_DISPATCH_*` variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// When set, logs are also written to a daily-rolling file in this directory.
    pub log_dir: Option<PathBuf>,
    pub dispatch: DispatchConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source (used by tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = DispatchConfig::default();

        let port = parse_or(&lookup, "LLM_DISPATCH_PORT", 8080u16)?;
        let db_path = lookup("LLM_DISPATCH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/llm-dispatch.db"));
        let log_dir = lookup("LLM_DISPATCH_LOG_DIR").map(PathBuf::from);

        let dispatch = DispatchConfig {
            dead_timeout: secs_or(&lookup, "LLM_DISPATCH_DEAD_TIMEOUT_SECS", defaults.dead_timeout)?,
            heartbeat_interval: secs_or(
                &lookup,
                "LLM_DISPATCH_HEARTBEAT_SECS",
                defaults.heartbeat_interval,
            )?,
            sweep_interval: secs_or(
                &lookup,
                "LLM_DISPATCH_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval,
            )?,
            dead_threshold: secs_or(
                &lookup,
                "LLM_DISPATCH_DEAD_THRESHOLD_SECS",
                defaults.dead_threshold,
            )?,
            max_retries: parse_or(&lookup, "LLM_DISPATCH_MAX_RETRIES", defaults.max_retries)?,
            retry_same_worker_probability: parse_or(
                &lookup,
                "LLM_DISPATCH_RETRY_SAME_WORKER_PROBABILITY",
                defaults.retry_same_worker_probability,
            )?,
            ..defaults
        };
        dispatch.validate()?;

        Ok(Self {
            port,
            db_path,
            log_dir,
            dispatch,
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

/// Worker-side settings for the completion loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interval between heartbeats while a job is being generated.
    pub heartbeat_interval: Duration,
    /// Delays between attempts at generating a completion.
    pub retry_backoff: Vec<Duration>,
    /// Upper bound of random jitter added to each backoff delay.
    pub retry_jitter: Duration,
    /// Long-poll timeout when waiting for work.
    pub wait_timeout: Duration,
    /// Byte length at which a streamed chunk is flushed even without a delimiter.
    pub flush_len: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: 20 * SECOND,
            retry_backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(10),
                Duration::from_secs(20),
            ],
            retry_jitter: Duration::from_millis(100),
            wait_timeout: 30 * SECOND,
            flush_len: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn dispatch_config_default() {
        let cfg = DispatchConfig::default();
        assert_eq!(cfg.dead_timeout, Duration::from_secs(60));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(cfg.dead_threshold, Duration::from_secs(30));
        assert_eq!(cfg.max_retries, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn heartbeat_must_be_shorter_than_timeout() {
        let cfg = DispatchConfig {
            heartbeat_interval: Duration::from_secs(60),
            ..DispatchConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "heartbeat_interval"
        ));
    }

    #[test]
    fn default_limiters_present() {
        let limits = RateLimitsConfig::default();
        let enqueue = limits.get(ENQUEUE_JOB).unwrap();
        assert_eq!(enqueue.rate, 10);
        assert_eq!(enqueue.capacity(), 3);
        assert_eq!(limits.get(JOIN_THREAD).unwrap().capacity(), 1);
        assert!(matches!(
            limits.get("nope"),
            Err(ConfigError::UnknownLimiter(_))
        ));
    }

    #[test]
    fn zero_rate_limiter_rejected() {
        let cfg = DispatchConfig {
            rate_limits: RateLimitsConfig::default()
                .with("broken", LimiterConfig::token_bucket(0, Duration::from_secs(1))),
            ..DispatchConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn server_config_defaults_without_env() {
        let cfg = ServerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.db_path, PathBuf::from("./data/llm-dispatch.db"));
        assert!(cfg.log_dir.is_none());
    }

    #[test]
    fn server_config_reads_overrides() {
        let cfg = ServerConfig::from_lookup(lookup_from(&[
            ("LLM_DISPATCH_PORT", "9000"),
            ("LLM_DISPATCH_DEAD_TIMEOUT_SECS", "9"),
            ("LLM_DISPATCH_HEARTBEAT_SECS", "3"),
            ("LLM_DISPATCH_MAX_RETRIES", "5"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.dispatch.dead_timeout, Duration::from_secs(9));
        assert_eq!(cfg.dispatch.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(cfg.dispatch.max_retries, 5);
    }

    #[test]
    fn server_config_rejects_garbage() {
        let err = ServerConfig::from_lookup(lookup_from(&[("LLM_DISPATCH_PORT", "eighty")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "LLM_DISPATCH_PORT"));
    }
}
