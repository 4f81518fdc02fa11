//! Error types for Conveyor.

use uuid::Uuid;

use crate::queue::task::{Task, TaskState};

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Recoverable: the caller already owns a live task for this key and
    /// should use the one carried here instead of treating this as a failure.
    #[error("Idempotency key '{key}' already in use by task {}", .existing.id)]
    DuplicateIdempotencyKey { key: String, existing: Box<Task> },

    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} is not leased (state: {state})")]
    NotLeased { id: Uuid, state: TaskState },

    /// The caller's lease was reclaimed (or re-leased by another worker)
    /// before its ack/fail arrived. The result must be discarded.
    #[error("Lease on task {id} expired or was reclaimed")]
    LeaseExpired { id: Uuid },

    #[error("Task {id} cannot be cancelled in state {state}")]
    NotCancellable { id: Uuid, state: TaskState },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Schedule {id} not found")]
    NotFound { id: Uuid },

    #[error("Store unavailable after {consecutive} consecutive tick failures")]
    StoreUnavailable { consecutive: u32 },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Dispatcher errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Store unavailable after {consecutive} consecutive failures")]
    StoreUnavailable { consecutive: u32 },

    #[error("Dispatcher is already running")]
    AlreadyRunning,

    #[error("Shutdown left {owned} task(s) still leased by this process")]
    ShutdownIncomplete { owned: u64 },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_messages_render_capitalized() {
        let id = Uuid::nil();
        let err = Error::from(QueueError::NotFound { id });
        assert_eq!(err.to_string(), format!("Queue error: Task {id} not found"));

        let err = Error::from(ScheduleError::InvalidTrigger("bad".into()));
        assert_eq!(err.to_string(), "Schedule error: Invalid trigger: bad");

        let err = Error::from(DispatchError::AlreadyRunning);
        assert_eq!(
            err.to_string(),
            "Dispatch error: Dispatcher is already running"
        );
    }
}
