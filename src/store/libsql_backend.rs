//! libSQL backend — async `Database` trait implementation.
//!
//! All timestamps are stored as RFC 3339 text in UTC, so lexicographic
//! comparison in SQL matches chronological order. Lease hand-off is a
//! single `UPDATE ... WHERE id = (SELECT ...) RETURNING` statement;
//! SQLite serializes writers, so concurrent callers never pick the same
//! row.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::task::{Task, TaskCounts, TaskState};
use crate::retry::ErrorClass;
use crate::schedule::model::Schedule;
use crate::schedule::trigger::Trigger;
use crate::store::migrations;
use crate::store::traits::{Database, TaskFilter};

const DEFAULT_LIST_LIMIT: usize = 100;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Open(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Open(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Try SQLite datetime() output with fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    // Try SQLite datetime() output without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<i64>` to libsql Value.
fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

/// Detect a unique-index violation in a libsql error.
fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

/// Map a libsql Row to a Task.
///
/// Column order matches TASK_COLUMNS:
/// 0:id, 1:idempotency_key, 2:payload, 3:priority, 4:state,
/// 5:attempt_count, 6:max_attempts, 7:lease_owner, 8:lease_expires_at,
/// 9:available_at, 10:result, 11:last_error, 12:last_error_class,
/// 13:created_at, 14:updated_at
fn row_to_task(row: &libsql::Row) -> Result<Task, libsql::Error> {
    let id_str: String = row.get(0)?;
    let payload_str: String = row.get(2)?;
    let state_str: String = row.get(4)?;
    let lease_expires_str: Option<String> = row.get(8).ok();
    let available_str: String = row.get(9)?;
    let class_str: Option<String> = row.get(12).ok();
    let created_str: String = row.get(13)?;
    let updated_str: String = row.get(14)?;

    Ok(Task {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        idempotency_key: row.get(1).ok(),
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        priority: row.get(3)?,
        state: state_str.parse().unwrap_or(TaskState::Pending),
        attempt_count: row.get::<i64>(5)? as u32,
        max_attempts: row.get::<i64>(6)? as u32,
        lease_owner: row.get(7).ok(),
        lease_expires_at: parse_optional_datetime(&lease_expires_str),
        available_at: parse_datetime(&available_str),
        result: row.get(10).ok(),
        last_error: row.get(11).ok(),
        last_error_class: class_str.and_then(|s| s.parse::<ErrorClass>().ok()),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a Schedule.
///
/// Column order matches SCHEDULE_COLUMNS:
/// 0:id, 1:name, 2:trigger_type, 3:trigger_config, 4:timezone,
/// 5:task_payload, 6:task_priority, 7:task_max_attempts, 8:recurring,
/// 9:max_runs, 10:run_count, 11:next_fire_at, 12:last_fired_at,
/// 13:active, 14:created_at, 15:updated_at
fn row_to_schedule(row: &libsql::Row) -> Result<Schedule, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("schedule row parse: {e}"));

    let id_str: String = row.get(0).map_err(read)?;
    let trigger_type: String = row.get(2).map_err(read)?;
    let trigger_config_str: String = row.get(3).map_err(read)?;
    let payload_str: String = row.get(5).map_err(read)?;
    let next_fire_str: Option<String> = row.get(11).ok();
    let last_fired_str: Option<String> = row.get(12).ok();
    let created_str: String = row.get(14).map_err(read)?;
    let updated_str: String = row.get(15).map_err(read)?;

    let trigger_config: serde_json::Value = serde_json::from_str(&trigger_config_str)
        .map_err(|e| DatabaseError::Serialization(format!("trigger config: {e}")))?;
    let trigger = Trigger::from_db(&trigger_type, trigger_config)
        .map_err(DatabaseError::Serialization)?;

    Ok(Schedule {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        name: row.get(1).map_err(read)?,
        trigger,
        timezone: row.get(4).map_err(read)?,
        task_payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        task_priority: row.get(6).map_err(read)?,
        task_max_attempts: row.get::<i64>(7).ok().map(|v| v as u32),
        recurring: row.get::<i64>(8).map_err(read)? != 0,
        max_runs: row.get::<i64>(9).ok().map(|v| v as u32),
        run_count: row.get::<i64>(10).map_err(read)? as u32,
        next_fire_at: parse_optional_datetime(&next_fire_str),
        last_fired_at: parse_optional_datetime(&last_fired_str),
        active: row.get::<i64>(13).map_err(read)? != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, idempotency_key, payload, priority, state, attempt_count, max_attempts, lease_owner, lease_expires_at, available_at, result, last_error, last_error_class, created_at, updated_at";

const SCHEDULE_COLUMNS: &str = "id, name, trigger_type, trigger_config, timezone, task_payload, task_priority, task_max_attempts, recurring, max_runs, run_count, next_fire_at, last_fired_at, active, created_at, updated_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let payload_json = serde_json::to_string(&task.payload)
            .map_err(|e| DatabaseError::Serialization(format!("task payload: {e}")))?;

        conn.execute(
            &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"),
            params![
                task.id.to_string(),
                opt_text(task.idempotency_key.as_deref()),
                payload_json,
                task.priority,
                task.state.as_str(),
                task.attempt_count as i64,
                task.max_attempts as i64,
                opt_text(task.lease_owner.as_deref()),
                opt_text_owned(task.lease_expires_at.map(|t| t.to_rfc3339())),
                task.available_at.to_rfc3339(),
                opt_text(task.result.as_deref()),
                opt_text(task.last_error.as_deref()),
                opt_text(task.last_error_class.map(|c| c.as_str())),
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DatabaseError::Constraint(format!("insert_task: {e}"))
            } else {
                DatabaseError::Query(format!("insert_task: {e}"))
            }
        })?;

        debug!(task_id = %task.id, priority = task.priority, "Task inserted into DB");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let task = row_to_task(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_task row parse: {e}")))?;
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn find_active_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Task>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE idempotency_key = ?1 AND state != 'dead_lettered' LIMIT 1"
                ),
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_active_by_idempotency_key: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let task = row_to_task(&row).map_err(|e| {
                    DatabaseError::Query(format!("find_active_by_idempotency_key row parse: {e}"))
                })?;
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "find_active_by_idempotency_key: {e}"
            ))),
        }
    }

    async fn lease_next(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<Task>, DatabaseError> {
        let conn = self.conn();
        let now_str = now.to_rfc3339();

        // Selection and transition in one statement. The subquery picks the
        // best candidate (pending and available, or an expired lease) and the
        // outer UPDATE claims it. A second caller re-evaluates the subquery
        // and gets the next row, never this one.
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE tasks SET
                        state = 'leased',
                        lease_owner = ?1,
                        lease_expires_at = ?2,
                        attempt_count = attempt_count + 1,
                        updated_at = ?3
                     WHERE id = (
                        SELECT id FROM tasks
                        WHERE (state = 'pending' AND available_at <= ?3)
                           OR (state = 'leased' AND lease_expires_at <= ?3)
                        ORDER BY priority DESC, available_at ASC, created_at ASC, rowid ASC
                        LIMIT 1
                     )
                     RETURNING {TASK_COLUMNS}"
                ),
                params![owner, lease_expires_at.to_rfc3339(), now_str],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("lease_next: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let task = row_to_task(&row)
                    .map_err(|e| DatabaseError::Query(format!("lease_next row parse: {e}")))?;
                debug!(task_id = %task.id, owner = owner, attempt = task.attempt_count, "Task leased");
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("lease_next: {e}"))),
        }
    }

    async fn mark_succeeded(
        &self,
        id: Uuid,
        owner: &str,
        result: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let affected = conn
            .execute(
                "UPDATE tasks SET
                    state = 'succeeded',
                    result = ?1,
                    lease_owner = NULL,
                    lease_expires_at = NULL,
                    updated_at = ?2
                 WHERE id = ?3 AND state = 'leased' AND lease_owner = ?4",
                params![opt_text(result), now.to_rfc3339(), id.to_string(), owner],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_succeeded: {e}")))?;

        Ok(affected == 1)
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        owner: &str,
        available_at: DateTime<Utc>,
        error: &str,
        class: ErrorClass,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let affected = conn
            .execute(
                "UPDATE tasks SET
                    state = 'pending',
                    available_at = ?1,
                    last_error = ?2,
                    last_error_class = ?3,
                    lease_owner = NULL,
                    lease_expires_at = NULL,
                    updated_at = ?4
                 WHERE id = ?5 AND state = 'leased' AND lease_owner = ?6",
                params![
                    available_at.to_rfc3339(),
                    error,
                    class.as_str(),
                    now.to_rfc3339(),
                    id.to_string(),
                    owner
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_retry: {e}")))?;

        Ok(affected == 1)
    }

    async fn mark_dead_lettered(
        &self,
        id: Uuid,
        owner: &str,
        error: &str,
        class: ErrorClass,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let affected = conn
            .execute(
                "UPDATE tasks SET
                    state = 'dead_lettered',
                    last_error = ?1,
                    last_error_class = ?2,
                    lease_owner = NULL,
                    lease_expires_at = NULL,
                    updated_at = ?3
                 WHERE id = ?4 AND state = 'leased' AND lease_owner = ?5",
                params![
                    error,
                    class.as_str(),
                    now.to_rfc3339(),
                    id.to_string(),
                    owner
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_dead_lettered: {e}")))?;

        Ok(affected == 1)
    }

    async fn cancel_task(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let affected = conn
            .execute(
                "UPDATE tasks SET state = 'cancelled', updated_at = ?1
                 WHERE id = ?2 AND state = 'pending'",
                params![now.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel_task: {e}")))?;

        Ok(affected == 1)
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        let requeued = conn
            .execute(
                "UPDATE tasks SET
                    state = 'pending',
                    lease_owner = NULL,
                    lease_expires_at = NULL,
                    available_at = ?1,
                    updated_at = ?1
                 WHERE state = 'leased' AND lease_expires_at <= ?1",
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_expired: {e}")))?;

        if requeued > 0 {
            info!(count = requeued, "Requeued expired leases");
        }
        Ok(requeued)
    }

    async fn requeue_owned(
        &self,
        owner_prefix: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        let requeued = conn
            .execute(
                "UPDATE tasks SET
                    state = 'pending',
                    lease_owner = NULL,
                    lease_expires_at = NULL,
                    available_at = ?1,
                    updated_at = ?1
                 WHERE state = 'leased' AND lease_owner LIKE ?2",
                params![now.to_rfc3339(), format!("{owner_prefix}%")],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_owned: {e}")))?;

        if requeued > 0 {
            info!(count = requeued, owner_prefix = owner_prefix, "Requeued owned leases");
        }
        Ok(requeued)
    }

    async fn count_owned(&self, owner_prefix: &str) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM tasks WHERE state = 'leased' AND lease_owner LIKE ?1",
                params![format!("{owner_prefix}%")],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_owned: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_owned: {e}")))?;
                Ok(count as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_owned: {e}"))),
        }
    }

    async fn count_leasable(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM tasks
                 WHERE (state = 'pending' AND available_at <= ?1)
                    OR (state = 'leased' AND lease_expires_at <= ?1)",
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_leasable: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_leasable: {e}")))?;
                Ok(count as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_leasable: {e}"))),
        }
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn();
        let limit = if filter.limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            filter.limit
        } as i64;

        let mut rows = match filter.state {
            Some(state) => conn
                .query(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks WHERE state = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                    ),
                    params![state.as_str(), limit],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?,
            None => conn
                .query(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                    ),
                    params![limit],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?,
        };

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    tracing::warn!("Skipping task row: {e}");
                }
            }
        }
        Ok(tasks)
    }

    async fn task_counts(&self, now: DateTime<Utc>) -> Result<TaskCounts, DatabaseError> {
        let conn = self.conn();
        let mut counts = TaskCounts::default();

        let mut rows = conn
            .query("SELECT state, COUNT(*) FROM tasks GROUP BY state", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("task_counts: {e}")))?;

        while let Ok(Some(row)) = rows.next().await {
            let state_str: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("task_counts: {e}")))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("task_counts: {e}")))?;
            let count = count as u64;
            counts.total += count;
            match state_str.parse::<TaskState>() {
                Ok(TaskState::Pending) => counts.pending += count,
                Ok(TaskState::Leased) => counts.leased += count,
                Ok(TaskState::Succeeded) => counts.succeeded += count,
                Ok(TaskState::DeadLettered) => counts.dead_lettered += count,
                Ok(TaskState::Cancelled) => counts.cancelled += count,
                Err(_) => {
                    tracing::warn!(state = %state_str, "Unknown task state in counts");
                }
            }
        }

        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM tasks WHERE state = 'pending' AND available_at > ?1",
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("task_counts: {e}")))?;
        if let Ok(Some(row)) = rows.next().await {
            let delayed: i64 = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("task_counts: {e}")))?;
            counts.delayed = delayed as u64;
        }

        Ok(counts)
    }

    // ── Schedules ───────────────────────────────────────────────────

    async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let payload_json = serde_json::to_string(&schedule.task_payload)
            .map_err(|e| DatabaseError::Serialization(format!("schedule payload: {e}")))?;

        conn.execute(
            &format!("INSERT INTO schedules ({SCHEDULE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"),
            params![
                schedule.id.to_string(),
                schedule.name.clone(),
                schedule.trigger.type_tag(),
                schedule.trigger.to_config_json().to_string(),
                schedule.timezone.clone(),
                payload_json,
                schedule.task_priority,
                opt_int(schedule.task_max_attempts.map(i64::from)),
                i64::from(schedule.recurring),
                opt_int(schedule.max_runs.map(i64::from)),
                schedule.run_count as i64,
                opt_text_owned(schedule.next_fire_at.map(|t| t.to_rfc3339())),
                opt_text_owned(schedule.last_fired_at.map(|t| t.to_rfc3339())),
                i64::from(schedule.active),
                schedule.created_at.to_rfc3339(),
                schedule.updated_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_schedule: {e}")))?;

        debug!(schedule_id = %schedule.id, trigger = schedule.trigger.type_tag(), "Schedule inserted into DB");
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_schedule: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_schedule(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_schedule: {e}"))),
        }
    }

    async fn list_schedules(&self, include_inactive: bool) -> Result<Vec<Schedule>, DatabaseError> {
        let conn = self.conn();
        let sql = if include_inactive {
            format!("SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at DESC, rowid DESC")
        } else {
            format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE active = 1 ORDER BY created_at DESC, rowid DESC"
            )
        };
        let mut rows = conn
            .query(&sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_schedules: {e}")))?;

        let mut schedules = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_schedule(&row) {
                Ok(schedule) => schedules.push(schedule),
                Err(e) => {
                    tracing::warn!("Skipping schedule row: {e}");
                }
            }
        }
        Ok(schedules)
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules
                     WHERE active = 1 AND next_fire_at IS NOT NULL AND next_fire_at <= ?1
                     ORDER BY next_fire_at ASC"
                ),
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_schedules: {e}")))?;

        let mut schedules = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_schedule(&row) {
                Ok(schedule) => schedules.push(schedule),
                Err(e) => {
                    tracing::warn!("Skipping schedule row: {e}");
                }
            }
        }
        Ok(schedules)
    }

    async fn record_schedule_fire(
        &self,
        id: Uuid,
        fired_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
        active: bool,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE schedules SET
                run_count = run_count + 1,
                last_fired_at = ?1,
                next_fire_at = ?2,
                active = ?3,
                updated_at = ?1
             WHERE id = ?4",
            params![
                fired_at.to_rfc3339(),
                opt_text_owned(next_fire_at.map(|t| t.to_rfc3339())),
                i64::from(active),
                id.to_string()
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_schedule_fire: {e}")))?;

        debug!(schedule_id = %id, active = active, "Schedule fire recorded");
        Ok(())
    }

    async fn set_schedule_active(&self, id: Uuid, active: bool) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let affected = conn
            .execute(
                "UPDATE schedules SET active = ?1, updated_at = ?2 WHERE id = ?3",
                params![i64::from(active), Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_schedule_active: {e}")))?;

        Ok(affected == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::task::NewTask;
    use crate::schedule::model::NewSchedule;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_task(payload: serde_json::Value) -> Task {
        Task::from_request(NewTask::new(payload), 3)
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let db = test_db().await;
        let task = make_task(serde_json::json!({"kind": "email", "to": "ada"}));
        db.insert_task(&task).await.unwrap();

        let loaded = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.payload, task.payload);
        assert_eq!(loaded.state, TaskState::Pending);
        assert_eq!(loaded.attempt_count, 0);
        assert_eq!(loaded.max_attempts, 3);
        assert!(loaded.lease_owner.is_none());
    }

    #[tokio::test]
    async fn get_task_missing_returns_none() {
        let db = test_db().await;
        assert!(db.get_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_hits_constraint() {
        let db = test_db().await;
        let t1 = Task::from_request(
            NewTask::new(serde_json::json!({})).with_idempotency_key("report-42"),
            3,
        );
        let t2 = Task::from_request(
            NewTask::new(serde_json::json!({})).with_idempotency_key("report-42"),
            3,
        );
        db.insert_task(&t1).await.unwrap();
        let err = db.insert_task(&t2).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn find_active_by_key_ignores_dead_lettered() {
        let db = test_db().await;
        let task = Task::from_request(
            NewTask::new(serde_json::json!({})).with_idempotency_key("k"),
            3,
        );
        db.insert_task(&task).await.unwrap();
        assert!(db
            .find_active_by_idempotency_key("k")
            .await
            .unwrap()
            .is_some());

        let now = Utc::now();
        let leased = db
            .lease_next("w1", now, now + ChronoDuration::seconds(300))
            .await
            .unwrap()
            .unwrap();
        assert!(db
            .mark_dead_lettered(leased.id, "w1", "boom", ErrorClass::Permanent, now)
            .await
            .unwrap());

        assert!(db
            .find_active_by_idempotency_key("k")
            .await
            .unwrap()
            .is_none());

        // The key is free again for a fresh insert
        let again = Task::from_request(
            NewTask::new(serde_json::json!({})).with_idempotency_key("k"),
            3,
        );
        db.insert_task(&again).await.unwrap();
    }

    #[tokio::test]
    async fn lease_prefers_priority_then_fifo() {
        let db = test_db().await;
        let low_a = Task::from_request(NewTask::new(serde_json::json!({"n": 1})).with_priority(1), 3);
        let high = Task::from_request(NewTask::new(serde_json::json!({"n": 2})).with_priority(5), 3);
        let low_b = Task::from_request(NewTask::new(serde_json::json!({"n": 3})).with_priority(1), 3);
        db.insert_task(&low_a).await.unwrap();
        db.insert_task(&high).await.unwrap();
        db.insert_task(&low_b).await.unwrap();

        let now = Utc::now();
        let expires = now + ChronoDuration::seconds(300);

        let first = db.lease_next("w", now, expires).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);

        let second = db.lease_next("w", now, expires).await.unwrap().unwrap();
        assert_eq!(second.id, low_a.id);

        let third = db.lease_next("w", now, expires).await.unwrap().unwrap();
        assert_eq!(third.id, low_b.id);

        assert!(db.lease_next("w", now, expires).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lease_sets_owner_expiry_and_attempt() {
        let db = test_db().await;
        let task = make_task(serde_json::json!({}));
        db.insert_task(&task).await.unwrap();

        let now = Utc::now();
        let expires = now + ChronoDuration::seconds(60);
        let leased = db.lease_next("w7", now, expires).await.unwrap().unwrap();

        assert_eq!(leased.state, TaskState::Leased);
        assert_eq!(leased.lease_owner.as_deref(), Some("w7"));
        assert_eq!(leased.attempt_count, 1);
        let got_expiry = leased.lease_expires_at.unwrap();
        assert!((got_expiry - expires).num_seconds().abs() < 1);
    }

    #[tokio::test]
    async fn lease_skips_delayed_tasks() {
        let db = test_db().await;
        let now = Utc::now();
        let later = now + ChronoDuration::seconds(3600);
        let task = Task::from_request(
            NewTask::new(serde_json::json!({})).with_available_at(later),
            3,
        );
        db.insert_task(&task).await.unwrap();

        assert!(db
            .lease_next("w", now, now + ChronoDuration::seconds(60))
            .await
            .unwrap()
            .is_none());

        // Once the clock passes available_at the task is leasable
        let after = later + ChronoDuration::seconds(1);
        let leased = db
            .lease_next("w", after, after + ChronoDuration::seconds(60))
            .await
            .unwrap();
        assert_eq!(leased.unwrap().id, task.id);
    }

    #[tokio::test]
    async fn lease_reclaims_expired_lease() {
        let db = test_db().await;
        let task = make_task(serde_json::json!({}));
        db.insert_task(&task).await.unwrap();

        let t0 = Utc::now();
        let leased = db
            .lease_next("crashed", t0, t0 + ChronoDuration::seconds(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.attempt_count, 1);

        // Before expiry nobody else can take it
        let t1 = t0 + ChronoDuration::seconds(2);
        assert!(db
            .lease_next("other", t1, t1 + ChronoDuration::seconds(5))
            .await
            .unwrap()
            .is_none());

        // After expiry the task is reclaimable
        let t2 = t0 + ChronoDuration::seconds(6);
        let reclaimed = db
            .lease_next("other", t2, t2 + ChronoDuration::seconds(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, task.id);
        assert_eq!(reclaimed.lease_owner.as_deref(), Some("other"));
        assert_eq!(reclaimed.attempt_count, 2);
    }

    #[tokio::test]
    async fn concurrent_leases_never_share_a_task() {
        let db = std::sync::Arc::new(test_db().await);
        for i in 0..5 {
            db.insert_task(&make_task(serde_json::json!({"n": i})))
                .await
                .unwrap();
        }

        let now = Utc::now();
        let expires = now + ChronoDuration::seconds(300);
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let db = db.clone();
                let owner = format!("w{i}");
                tokio::spawn(async move { db.lease_next(&owner, now, expires).await.unwrap() })
            })
            .collect();

        let mut seen = std::collections::HashSet::new();
        let mut granted = 0;
        for handle in handles {
            if let Some(task) = handle.await.unwrap() {
                granted += 1;
                assert!(seen.insert(task.id), "task leased twice: {}", task.id);
            }
        }
        assert_eq!(granted, 5);
    }

    #[tokio::test]
    async fn mark_succeeded_guards_on_owner() {
        let db = test_db().await;
        let task = make_task(serde_json::json!({}));
        db.insert_task(&task).await.unwrap();

        let now = Utc::now();
        let leased = db
            .lease_next("w1", now, now + ChronoDuration::seconds(60))
            .await
            .unwrap()
            .unwrap();

        // Wrong owner changes nothing
        assert!(!db
            .mark_succeeded(leased.id, "intruder", None, now)
            .await
            .unwrap());
        assert_eq!(
            db.get_task(leased.id).await.unwrap().unwrap().state,
            TaskState::Leased
        );

        assert!(db
            .mark_succeeded(leased.id, "w1", Some("42 rows"), now)
            .await
            .unwrap());
        let done = db.get_task(leased.id).await.unwrap().unwrap();
        assert_eq!(done.state, TaskState::Succeeded);
        assert_eq!(done.result.as_deref(), Some("42 rows"));
        assert!(done.lease_owner.is_none());
        assert!(done.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn mark_retry_returns_task_to_pending() {
        let db = test_db().await;
        let task = make_task(serde_json::json!({}));
        db.insert_task(&task).await.unwrap();

        let now = Utc::now();
        let leased = db
            .lease_next("w1", now, now + ChronoDuration::seconds(60))
            .await
            .unwrap()
            .unwrap();

        let retry_at = now + ChronoDuration::seconds(4);
        assert!(db
            .mark_retry(leased.id, "w1", retry_at, "connection reset", ErrorClass::Transient, now)
            .await
            .unwrap());

        let pending = db.get_task(leased.id).await.unwrap().unwrap();
        assert_eq!(pending.state, TaskState::Pending);
        assert_eq!(pending.attempt_count, 1);
        assert_eq!(pending.last_error.as_deref(), Some("connection reset"));
        assert_eq!(pending.last_error_class, Some(ErrorClass::Transient));
        assert!(pending.lease_owner.is_none());

        // Not leasable until the backoff passes
        assert!(db
            .lease_next("w2", now, now + ChronoDuration::seconds(60))
            .await
            .unwrap()
            .is_none());
        let after = retry_at + ChronoDuration::seconds(1);
        assert!(db
            .lease_next("w2", after, after + ChronoDuration::seconds(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn cancel_only_while_pending() {
        let db = test_db().await;
        let pending = make_task(serde_json::json!({}));
        db.insert_task(&pending).await.unwrap();
        assert!(db.cancel_task(pending.id, Utc::now()).await.unwrap());
        assert_eq!(
            db.get_task(pending.id).await.unwrap().unwrap().state,
            TaskState::Cancelled
        );

        let leased = make_task(serde_json::json!({}));
        db.insert_task(&leased).await.unwrap();
        let now = Utc::now();
        db.lease_next("w", now, now + ChronoDuration::seconds(60))
            .await
            .unwrap()
            .unwrap();
        assert!(!db.cancel_task(leased.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn requeue_expired_leaves_attempts_alone() {
        let db = test_db().await;
        let task = make_task(serde_json::json!({}));
        db.insert_task(&task).await.unwrap();

        let t0 = Utc::now();
        db.lease_next("w", t0, t0 + ChronoDuration::seconds(5))
            .await
            .unwrap()
            .unwrap();

        // Nothing expired yet
        assert_eq!(db.requeue_expired(t0).await.unwrap(), 0);

        let t1 = t0 + ChronoDuration::seconds(6);
        assert_eq!(db.requeue_expired(t1).await.unwrap(), 1);

        let back = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(back.state, TaskState::Pending);
        assert_eq!(back.attempt_count, 1);
        assert!(back.lease_owner.is_none());
    }

    #[tokio::test]
    async fn requeue_owned_matches_prefix_only() {
        let db = test_db().await;
        for i in 0..3 {
            db.insert_task(&make_task(serde_json::json!({"n": i})))
                .await
                .unwrap();
        }

        let now = Utc::now();
        let expires = now + ChronoDuration::seconds(300);
        db.lease_next("inst-a/worker-0", now, expires)
            .await
            .unwrap()
            .unwrap();
        db.lease_next("inst-a/worker-1", now, expires)
            .await
            .unwrap()
            .unwrap();
        db.lease_next("inst-b/worker-0", now, expires)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(db.count_owned("inst-a/").await.unwrap(), 2);
        assert_eq!(db.requeue_owned("inst-a/", now).await.unwrap(), 2);
        assert_eq!(db.count_owned("inst-a/").await.unwrap(), 0);
        // The other instance's lease is untouched
        assert_eq!(db.count_owned("inst-b/").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn count_leasable_includes_expired_leases() {
        let db = test_db().await;
        let now = Utc::now();

        db.insert_task(&make_task(serde_json::json!({"a": 1})))
            .await
            .unwrap();
        db.insert_task(&Task::from_request(
            NewTask::new(serde_json::json!({"b": 2}))
                .with_available_at(now + ChronoDuration::seconds(3600)),
            3,
        ))
        .await
        .unwrap();
        db.insert_task(&make_task(serde_json::json!({"c": 3})))
            .await
            .unwrap();

        // Lease one with a short expiry
        db.lease_next("w", now, now + ChronoDuration::seconds(5))
            .await
            .unwrap()
            .unwrap();

        // One pending-available + one live lease + one delayed
        assert_eq!(db.count_leasable(now).await.unwrap(), 1);

        // After the lease expires it counts again
        let later = now + ChronoDuration::seconds(6);
        assert_eq!(db.count_leasable(later).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn list_tasks_newest_first_with_state_filter() {
        let db = test_db().await;
        let first = make_task(serde_json::json!({"n": 1}));
        let second = make_task(serde_json::json!({"n": 2}));
        db.insert_task(&first).await.unwrap();
        db.insert_task(&second).await.unwrap();

        let all = db.list_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second.id);
        assert_eq!(all[1].id, first.id);

        let now = Utc::now();
        let leased = db
            .lease_next("w", now, now + ChronoDuration::seconds(60))
            .await
            .unwrap()
            .unwrap();
        let pending_only = db
            .list_tasks(&TaskFilter::state(TaskState::Pending))
            .await
            .unwrap();
        assert_eq!(pending_only.len(), 1);
        assert_ne!(pending_only[0].id, leased.id);

        let limited = db
            .list_tasks(&TaskFilter::default().with_limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn task_counts_by_state() {
        let db = test_db().await;
        let now = Utc::now();

        db.insert_task(&make_task(serde_json::json!({"a": 1})))
            .await
            .unwrap();
        db.insert_task(&Task::from_request(
            NewTask::new(serde_json::json!({"b": 2}))
                .with_available_at(now + ChronoDuration::seconds(600)),
            3,
        ))
        .await
        .unwrap();
        db.insert_task(&make_task(serde_json::json!({"c": 3})))
            .await
            .unwrap();

        let leased = db
            .lease_next("w", now, now + ChronoDuration::seconds(60))
            .await
            .unwrap()
            .unwrap();
        db.mark_succeeded(leased.id, "w", None, now).await.unwrap();

        let counts = db.task_counts(now).await.unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.leased, 0);
    }

    // ── Schedules ───────────────────────────────────────────────────

    #[tokio::test]
    async fn schedule_roundtrip_preserves_trigger() {
        let db = test_db().await;
        let now = Utc::now();
        let schedule = Schedule::from_request(
            NewSchedule::new(
                Trigger::Cron {
                    expr: "0 0 9 * * * *".to_string(),
                },
                serde_json::json!({"job": "digest"}),
            )
            .with_name("morning digest")
            .in_timezone("Europe/Berlin")
            .recurring(true)
            .with_max_runs(10),
            now,
        )
        .unwrap();
        db.insert_schedule(&schedule).await.unwrap();

        let loaded = db.get_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "morning digest");
        assert_eq!(loaded.timezone, "Europe/Berlin");
        assert!(loaded.recurring);
        assert_eq!(loaded.max_runs, Some(10));
        assert_eq!(loaded.run_count, 0);
        assert!(loaded.active);
        match loaded.trigger {
            Trigger::Cron { ref expr } => assert_eq!(expr, "0 0 9 * * * *"),
            ref other => panic!("wrong trigger: {other:?}"),
        }
        assert_eq!(loaded.next_fire_at, schedule.next_fire_at);
    }

    #[tokio::test]
    async fn due_schedules_only_when_due_and_active() {
        let db = test_db().await;
        let now = Utc::now();

        let due = Schedule::from_request(
            NewSchedule::new(
                Trigger::In {
                    offset: Duration::from_secs(60),
                },
                serde_json::json!({}),
            ),
            now,
        )
        .unwrap();
        let not_due = Schedule::from_request(
            NewSchedule::new(
                Trigger::In {
                    offset: Duration::from_secs(3600),
                },
                serde_json::json!({}),
            ),
            now,
        )
        .unwrap();
        db.insert_schedule(&due).await.unwrap();
        db.insert_schedule(&not_due).await.unwrap();

        let at = now + ChronoDuration::seconds(90);
        let due_list = db.list_due_schedules(at).await.unwrap();
        assert_eq!(due_list.len(), 1);
        assert_eq!(due_list[0].id, due.id);

        // Deactivated schedules never show up as due
        assert!(db.set_schedule_active(due.id, false).await.unwrap());
        assert!(db.list_due_schedules(at).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_fire_updates_bookkeeping() {
        let db = test_db().await;
        let now = Utc::now();
        let schedule = Schedule::from_request(
            NewSchedule::new(
                Trigger::In {
                    offset: Duration::from_secs(60),
                },
                serde_json::json!({}),
            )
            .recurring(true),
            now,
        )
        .unwrap();
        db.insert_schedule(&schedule).await.unwrap();

        let fired_at = now + ChronoDuration::seconds(60);
        let next = fired_at + ChronoDuration::seconds(60);
        db.record_schedule_fire(schedule.id, fired_at, Some(next), true)
            .await
            .unwrap();

        let loaded = db.get_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(loaded.run_count, 1);
        assert!(loaded.active);
        assert_eq!(
            loaded.last_fired_at.unwrap().timestamp(),
            fired_at.timestamp()
        );
        assert_eq!(loaded.next_fire_at.unwrap().timestamp(), next.timestamp());

        // A final fire clears next_fire_at and deactivates
        db.record_schedule_fire(schedule.id, next, None, false)
            .await
            .unwrap();
        let done = db.get_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(done.run_count, 2);
        assert!(!done.active);
        assert!(done.next_fire_at.is_none());
    }

    #[tokio::test]
    async fn list_schedules_filters_inactive() {
        let db = test_db().await;
        let now = Utc::now();
        let a = Schedule::from_request(
            NewSchedule::new(
                Trigger::In {
                    offset: Duration::from_secs(60),
                },
                serde_json::json!({}),
            ),
            now,
        )
        .unwrap();
        let b = Schedule::from_request(
            NewSchedule::new(
                Trigger::In {
                    offset: Duration::from_secs(60),
                },
                serde_json::json!({}),
            ),
            now,
        )
        .unwrap();
        db.insert_schedule(&a).await.unwrap();
        db.insert_schedule(&b).await.unwrap();
        db.set_schedule_active(b.id, false).await.unwrap();

        assert_eq!(db.list_schedules(false).await.unwrap().len(), 1);
        assert_eq!(db.list_schedules(true).await.unwrap().len(), 2);
    }
}
