//! Unified `Database` trait — single async interface for all persistence.
//!
//! Every mutation the queue and scheduler perform goes through this trait,
//! so tests can run against an in-memory backend and the conditional
//! guards (lease ownership, cancellation-while-pending) live in one place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::task::{Task, TaskCounts, TaskState};
use crate::retry::ErrorClass;
use crate::schedule::model::Schedule;

/// Filter for read-only task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Restrict to a single state; `None` lists everything.
    pub state: Option<TaskState>,
    /// Maximum rows returned; 0 means the backend default (100).
    pub limit: usize,
}

impl TaskFilter {
    pub fn state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            limit: 0,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Backend-agnostic database trait covering tasks and schedules.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task row.
    ///
    /// A live duplicate of `idempotency_key` surfaces as
    /// [`DatabaseError::Constraint`].
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Find the task currently holding an idempotency key, if any.
    /// Dead-lettered tasks release their key and are not returned.
    async fn find_active_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Task>, DatabaseError>;

    /// Atomically lease the best candidate task for `owner`.
    ///
    /// Candidates are pending tasks whose `available_at` has passed, plus
    /// leased tasks whose lease has expired. Selection order is priority
    /// descending, then availability, then insertion order. Selection and
    /// transition happen in a single statement so concurrent callers never
    /// receive the same task.
    async fn lease_next(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<Task>, DatabaseError>;

    /// Transition a task Leased→Succeeded, guarded on `owner` still holding
    /// the lease. Returns false if the guard did not match.
    async fn mark_succeeded(
        &self,
        id: Uuid,
        owner: &str,
        result: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Transition a task Leased→Pending for a later retry, guarded on
    /// `owner`. Returns false if the guard did not match.
    async fn mark_retry(
        &self,
        id: Uuid,
        owner: &str,
        available_at: DateTime<Utc>,
        error: &str,
        class: ErrorClass,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Transition a task Leased→DeadLettered, guarded on `owner`.
    /// Returns false if the guard did not match.
    async fn mark_dead_lettered(
        &self,
        id: Uuid,
        owner: &str,
        error: &str,
        class: ErrorClass,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Cancel a task if (and only if) it is still Pending.
    /// Returns false when the task is missing or in any other state.
    async fn cancel_task(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// Return all expired leases to Pending with `available_at = now`.
    /// Attempt counts are left untouched. Returns the number requeued.
    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError>;

    /// Return every task leased by an owner matching `owner_prefix` to
    /// Pending, expired or not. Used during shutdown to hand back work this
    /// process will never finish. Returns the number requeued.
    async fn requeue_owned(
        &self,
        owner_prefix: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    /// Count tasks still leased by an owner matching `owner_prefix`.
    async fn count_owned(&self, owner_prefix: &str) -> Result<u64, DatabaseError>;

    /// Count tasks a worker could lease right now (pending and available,
    /// plus expired leases). Drives the autoscaler's backlog measure.
    async fn count_leasable(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError>;

    /// List tasks, most recently created first.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError>;

    /// Per-state task counts.
    async fn task_counts(&self, now: DateTime<Utc>) -> Result<TaskCounts, DatabaseError>;

    // ── Schedules ───────────────────────────────────────────────────

    /// Insert a new schedule row.
    async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), DatabaseError>;

    /// Get a schedule by ID.
    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, DatabaseError>;

    /// List schedules, newest first. Inactive ones included on request.
    async fn list_schedules(&self, include_inactive: bool) -> Result<Vec<Schedule>, DatabaseError>;

    /// List active schedules whose `next_fire_at` has passed.
    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, DatabaseError>;

    /// Record one firing: bump `run_count`, stamp `last_fired_at`, and move
    /// `next_fire_at` forward (or deactivate when `next_fire_at` is `None`
    /// or `active` is false).
    async fn record_schedule_fire(
        &self,
        id: Uuid,
        fired_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
        active: bool,
    ) -> Result<(), DatabaseError>;

    /// Flip a schedule's `active` flag. Returns false if the schedule is
    /// missing.
    async fn set_schedule_active(&self, id: Uuid, active: bool) -> Result<bool, DatabaseError>;
}
