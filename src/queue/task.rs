//! Task model and lifecycle states.
//!
//! A task is an opaque unit of work persisted in the durable store. It is
//! created by `enqueue`, mutated only through queue operations (lease, ack,
//! fail, requeue, cancel), and retained after reaching a terminal state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::ErrorClass;

/// Lifecycle state of a task.
///
/// Transitions are one-directional except Leased→Pending, which happens on
/// retry (fail with attempts remaining) and on reclaim of an expired lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting to be leased (possibly delayed via `available_at`).
    Pending,
    /// Exclusively claimed by one worker until ack, fail, or lease expiry.
    Leased,
    /// Terminal: completed successfully.
    Succeeded,
    /// Terminal: failed permanently, retained for inspection.
    DeadLettered,
    /// Terminal: cancelled while still Pending.
    Cancelled,
}

impl TaskState {
    /// The string stored in the DB state column.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Leased => "leased",
            TaskState::Succeeded => "succeeded",
            TaskState::DeadLettered => "dead_lettered",
            TaskState::Cancelled => "cancelled",
        }
    }

    /// Terminal states are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::DeadLettered | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "leased" => Ok(TaskState::Leased),
            "succeeded" => Ok(TaskState::Succeeded),
            "dead_lettered" => Ok(TaskState::DeadLettered),
            "cancelled" => Ok(TaskState::Cancelled),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// A persisted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub idempotency_key: Option<String>,
    /// Opaque work description handed to the task runner.
    pub payload: serde_json::Value,
    /// Higher priorities are leased first; ties break FIFO by enqueue time.
    pub priority: i64,
    pub state: TaskState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Worker holding the live lease. Set only while Leased.
    pub lease_owner: Option<String>,
    /// A lease past this instant is abandoned and reclaimable.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Not leasable before this instant; used for delayed retries.
    pub available_at: DateTime<Utc>,
    /// Runner output recorded on ack.
    pub result: Option<String>,
    /// Most recent failure, retained through retries and dead-lettering.
    pub last_error: Option<String>,
    pub last_error_class: Option<ErrorClass>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a fresh Pending task from an enqueue request.
    pub fn from_request(req: NewTask, default_max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            idempotency_key: req.idempotency_key,
            payload: req.payload,
            priority: req.priority,
            state: TaskState::Pending,
            attempt_count: 0,
            max_attempts: req.max_attempts.unwrap_or(default_max_attempts),
            lease_owner: None,
            lease_expires_at: None,
            available_at: req.available_at.unwrap_or(now),
            result: None,
            last_error: None,
            last_error_class: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True if the task is Pending with a future `available_at`.
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Pending && self.available_at > now
    }
}

/// Parameters for `enqueue`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub priority: i64,
    /// Defaults to now when unset.
    pub available_at: Option<DateTime<Utc>>,
    /// Defaults to the queue's configured `max_attempts` when unset.
    pub max_attempts: Option<u32>,
}

impl NewTask {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            idempotency_key: None,
            priority: 0,
            available_at: None,
            max_attempts: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }
}

/// Per-state row counts, as reported by `TaskQueue::counts`.
///
/// `delayed` counts Pending tasks whose `available_at` is still in the
/// future; they are included in `pending` as well.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub total: u64,
    pub pending: u64,
    pub delayed: u64,
    pub leased: u64,
    pub succeeded: u64,
    pub dead_lettered: u64,
    pub cancelled: u64,
}
