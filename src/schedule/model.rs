//! Core types for the scheduling system.
//!
//! A schedule pairs a trigger with a task template. When the trigger is due
//! the scheduler enqueues one task built from the template, stamped with a
//! per-firing idempotency key so a crash between enqueue and bookkeeping
//! cannot produce duplicates.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScheduleError;
use crate::schedule::trigger::{Trigger, parse_timezone};

/// A persistent schedule: trigger, task template, and firing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub trigger: Trigger,
    /// IANA timezone name the trigger is evaluated in.
    pub timezone: String,
    pub task_payload: serde_json::Value,
    pub task_priority: i64,
    /// Per-template attempt budget; `None` uses the queue default.
    pub task_max_attempts: Option<u32>,
    /// Re-fires a relative trigger after each run. Cron repeats regardless;
    /// an absolute trigger never does.
    pub recurring: bool,
    /// Firing cap; `None` means unlimited.
    pub max_runs: Option<u32>,

    // Runtime state (DB-managed)
    pub run_count: u32,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Build a schedule from a request, computing its first fire time.
    pub fn from_request(req: NewSchedule, now: DateTime<Utc>) -> Result<Self, ScheduleError> {
        let tz = parse_timezone(&req.timezone)?;
        let next_fire_at = req.trigger.initial_fire(now, tz)?;
        Ok(Self {
            id: Uuid::new_v4(),
            name: req.name,
            trigger: req.trigger,
            timezone: req.timezone,
            task_payload: req.payload,
            task_priority: req.priority,
            task_max_attempts: req.max_attempts,
            recurring: req.recurring,
            max_runs: req.max_runs,
            run_count: 0,
            next_fire_at,
            last_fired_at: None,
            active: next_fire_at.is_some(),
            created_at: now,
            updated_at: now,
        })
    }

    /// The parsed timezone this schedule's trigger is evaluated in.
    pub fn tz(&self) -> Result<Tz, ScheduleError> {
        parse_timezone(&self.timezone)
    }

    /// Whether the firing cap has been reached.
    pub fn exhausted(&self) -> bool {
        self.max_runs.is_some_and(|cap| self.run_count >= cap)
    }

    /// Idempotency key for the task enqueued by one particular firing.
    ///
    /// Deterministic in (schedule, fire time), so re-processing the same due
    /// firing after a crash dedupes against the already-enqueued task.
    pub fn fire_key(&self, fire_at: DateTime<Utc>) -> String {
        format!("sched:{}:{}", self.id, fire_at.timestamp_millis())
    }
}

/// Request to create a schedule. Start from [`NewSchedule::new`] and chain
/// the `with_*` builders for the optional fields.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub trigger: Trigger,
    pub timezone: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub max_attempts: Option<u32>,
    pub recurring: bool,
    pub max_runs: Option<u32>,
}

impl NewSchedule {
    pub fn new(trigger: Trigger, payload: serde_json::Value) -> Self {
        Self {
            name: String::new(),
            trigger,
            timezone: "UTC".to_string(),
            payload,
            priority: 0,
            max_attempts: None,
            recurring: false,
            max_runs: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn in_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = tz.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn recurring(mut self, recurring: bool) -> Self {
        self.recurring = recurring;
        self
    }

    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }
}
