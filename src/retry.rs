//! Retry policy: exponential backoff and the terminal-failure decision.
//!
//! Pure functions only. The queue consults this on every `fail` to choose
//! between re-enqueueing with a delay and dead-lettering.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of a task failure, reported by the task runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient fault (network blip, busy resource). Retryable.
    Transient,
    /// The work took too long. Retryable.
    Timeout,
    /// The payload cannot be executed as written. Dead-letters immediately.
    InvalidPayload,
    /// Known-permanent failure. Dead-letters immediately.
    Permanent,
}

impl ErrorClass {
    /// The string stored in the DB error class column.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Timeout => "timeout",
            ErrorClass::InvalidPayload => "invalid_payload",
            ErrorClass::Permanent => "permanent",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Timeout)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorClass::Transient),
            "timeout" => Ok(ErrorClass::Timeout),
            "invalid_payload" => Ok(ErrorClass::InvalidPayload),
            "permanent" => Ok(ErrorClass::Permanent),
            other => Err(format!("unknown error class: {other}")),
        }
    }
}

/// Outcome of consulting the policy after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue; the task becomes leasable again after `delay`.
    Retry { delay: Duration },
    /// No further attempts; the task is dead-lettered.
    DeadLetter,
}

/// Exponential backoff policy: `backoff(n) = base * 2^(n-1)`, capped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before the attempt following attempt number `n` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Decide what happens to a task whose attempt number `attempt_count`
    /// just failed with `class`.
    pub fn decide(&self, class: ErrorClass, attempt_count: u32, max_attempts: u32) -> RetryDecision {
        if !class.is_retryable() || attempt_count >= max_attempts {
            return RetryDecision::DeadLetter;
        }
        RetryDecision::Retry {
            delay: self.backoff(attempt_count),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}
