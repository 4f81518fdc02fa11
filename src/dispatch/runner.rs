//! Task runner abstraction — pure execution, no queue logic.
//!
//! The dispatcher leases tasks and hands them to a [`TaskRunner`]. What a
//! task *means* is entirely the runner's business; the queue only cares
//! whether it succeeded and, on failure, how the failure is classified.

use async_trait::async_trait;

use crate::queue::Task;
use crate::retry::ErrorClass;

/// A failed task attempt, classified for the retry policy.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub class: ErrorClass,
    pub message: String,
}

impl TaskFailure {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// A failure worth retrying after backoff.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    /// The attempt ran out of time; retryable.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Timeout, message)
    }

    /// The payload can never be executed; dead-letters immediately.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::InvalidPayload, message)
    }

    /// A failure that retrying cannot fix; dead-letters immediately.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent, message)
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// Executes leased tasks.
///
/// Implementations must be safe to call from many workers at once. A panic
/// inside `run` is treated as a transient failure of that attempt, not a
/// dispatcher fault.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Execute one task. `Ok` carries an optional result payload persisted
    /// with the task record.
    async fn run(&self, task: &Task) -> Result<Option<String>, TaskFailure>;
}

/// Built-in runner that logs each payload and succeeds.
///
/// Useful for smoke-testing a deployment before wiring a real runner.
pub struct LogRunner;

#[async_trait]
impl TaskRunner for LogRunner {
    async fn run(&self, task: &Task) -> Result<Option<String>, TaskFailure> {
        tracing::info!(task_id = %task.id, payload = %task.payload, "Executed task");
        Ok(None)
    }
}
