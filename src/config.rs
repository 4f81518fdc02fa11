//! Configuration types.
//!
//! All knobs are plain values passed into constructors. `from_env` reads the
//! `CONVEYOR_*` environment variables and falls back to defaults; invalid
//! values are reported rather than silently replaced.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Queue behavior: attempt budget, lease length, and retry backoff.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Default attempt budget for tasks that don't specify their own.
    pub max_attempts: u32,
    /// How long a lease lives before it is considered abandoned.
    pub lease_duration: Duration,
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lease_duration: Duration::from_secs(300), // 5 minutes
            retry: RetryConfig::default(),
        }
    }
}

/// Exponential backoff parameters for retried tasks.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// Autoscale policy knobs.
#[derive(Debug, Clone)]
pub struct AutoscaleConfig {
    pub enabled: bool,
    /// Scale up when pending tasks per active worker exceed this.
    pub scale_up_pending_per_worker: u32,
    /// Scale down after this many consecutive ticks with no lease granted.
    pub scale_down_idle_cycles: u32,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scale_up_pending_per_worker: 2,
            scale_down_idle_cycles: 3,
        }
    }
}

/// Dispatcher pool sizing and timing.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Initial worker count.
    pub default_concurrency: usize,
    /// Autoscale floor.
    pub min_concurrency: usize,
    /// Autoscale ceiling.
    pub max_concurrency: usize,
    pub autoscale: AutoscaleConfig,
    /// Pool-management and autoscale evaluation interval.
    pub tick_interval: Duration,
    /// Worker sleep between lease attempts when the queue is empty.
    pub poll_interval: Duration,
    /// How often the periodic expired-lease sweep runs.
    pub reclaim_interval: Duration,
    /// How long shutdown waits for in-flight tasks before requeueing them.
    pub grace_period: Duration,
    /// Consecutive store failures tolerated before the dispatcher gives up.
    pub max_store_failures: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 10,
            min_concurrency: 10,
            max_concurrency: 500,
            autoscale: AutoscaleConfig::default(),
            tick_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            reclaim_interval: Duration::from_secs(30),
            grace_period: Duration::from_secs(30),
            max_store_failures: 5,
        }
    }
}

/// Scheduler timing.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub max_store_failures: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_store_failures: 5,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub queue: QueueConfig,
    pub dispatcher: DispatcherConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/conveyor.db"),
            queue: QueueConfig::default(),
            dispatcher: DispatcherConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Config {
    /// Read configuration from `CONVEYOR_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let db_path = std::env::var("CONVEYOR_DB_PATH")
            .ok()
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let queue = QueueConfig {
            max_attempts: parse_value(
                "CONVEYOR_MAX_ATTEMPTS",
                env_raw("CONVEYOR_MAX_ATTEMPTS"),
                defaults.queue.max_attempts,
            )?,
            lease_duration: secs(
                "CONVEYOR_LEASE_DURATION_SECS",
                defaults.queue.lease_duration,
            )?,
            retry: RetryConfig {
                base_delay: secs(
                    "CONVEYOR_BACKOFF_BASE_SECS",
                    defaults.queue.retry.base_delay,
                )?,
                max_delay: secs("CONVEYOR_BACKOFF_MAX_SECS", defaults.queue.retry.max_delay)?,
            },
        };

        let autoscale = AutoscaleConfig {
            enabled: parse_bool(
                "CONVEYOR_AUTOSCALE",
                env_raw("CONVEYOR_AUTOSCALE"),
                defaults.dispatcher.autoscale.enabled,
            )?,
            scale_up_pending_per_worker: parse_value(
                "CONVEYOR_SCALE_UP_PENDING_PER_WORKER",
                env_raw("CONVEYOR_SCALE_UP_PENDING_PER_WORKER"),
                defaults.dispatcher.autoscale.scale_up_pending_per_worker,
            )?,
            scale_down_idle_cycles: parse_value(
                "CONVEYOR_SCALE_DOWN_IDLE_CYCLES",
                env_raw("CONVEYOR_SCALE_DOWN_IDLE_CYCLES"),
                defaults.dispatcher.autoscale.scale_down_idle_cycles,
            )?,
        };

        let dispatcher = DispatcherConfig {
            default_concurrency: parse_value(
                "CONVEYOR_DEFAULT_CONCURRENCY",
                env_raw("CONVEYOR_DEFAULT_CONCURRENCY"),
                defaults.dispatcher.default_concurrency,
            )?,
            min_concurrency: parse_value(
                "CONVEYOR_MIN_CONCURRENCY",
                env_raw("CONVEYOR_MIN_CONCURRENCY"),
                defaults.dispatcher.min_concurrency,
            )?,
            max_concurrency: parse_value(
                "CONVEYOR_MAX_CONCURRENCY",
                env_raw("CONVEYOR_MAX_CONCURRENCY"),
                defaults.dispatcher.max_concurrency,
            )?,
            autoscale,
            tick_interval: millis(
                "CONVEYOR_DISPATCH_TICK_MS",
                defaults.dispatcher.tick_interval,
            )?,
            poll_interval: millis(
                "CONVEYOR_POLL_INTERVAL_MS",
                defaults.dispatcher.poll_interval,
            )?,
            reclaim_interval: secs(
                "CONVEYOR_RECLAIM_INTERVAL_SECS",
                defaults.dispatcher.reclaim_interval,
            )?,
            grace_period: secs("CONVEYOR_GRACE_PERIOD_SECS", defaults.dispatcher.grace_period)?,
            max_store_failures: parse_value(
                "CONVEYOR_MAX_STORE_FAILURES",
                env_raw("CONVEYOR_MAX_STORE_FAILURES"),
                defaults.dispatcher.max_store_failures,
            )?,
        };

        let scheduler = SchedulerConfig {
            tick_interval: millis(
                "CONVEYOR_SCHEDULER_TICK_MS",
                defaults.scheduler.tick_interval,
            )?,
            max_store_failures: dispatcher.max_store_failures,
        };

        let config = Self {
            db_path,
            queue,
            dispatcher,
            scheduler,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject sizing combinations the dispatcher cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.dispatcher;
        if d.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CONVEYOR_MAX_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if d.min_concurrency > d.max_concurrency {
            return Err(ConfigError::InvalidValue {
                key: "CONVEYOR_MIN_CONCURRENCY".to_string(),
                message: format!(
                    "min_concurrency {} exceeds max_concurrency {}",
                    d.min_concurrency, d.max_concurrency
                ),
            });
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CONVEYOR_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn env_raw(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Parse an optional raw value, falling back to `default` when unset.
fn parse_value<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(s) => s.trim().parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{e} (got '{s}')"),
        }),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::trim) {
        None => Ok(default),
        Some("1") | Some("true") | Some("yes") | Some("on") => Ok(true),
        Some("0") | Some("false") | Some("no") | Some("off") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

fn secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_value(
        key,
        env_raw(key),
        default.as_secs(),
    )?))
}

fn millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parse_value(
        key,
        env_raw(key),
        default.as_millis() as u64,
    )?))
}
