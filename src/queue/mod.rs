//! Task queue — the API over the durable store.
//!
//! Every state transition goes through here: enqueue, lease, ack, fail,
//! cancel, and the two requeue paths. The store enforces the atomic guards;
//! this layer adds idempotency-key handling, the retry policy, and event
//! publication.

pub mod task;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{DatabaseError, QueueError};
use crate::events::{EventBus, QueueEvent};
use crate::retry::{ErrorClass, RetryDecision, RetryPolicy};
use crate::store::traits::{Database, TaskFilter};

pub use task::{NewTask, Task, TaskCounts, TaskState};

/// Handle to the persistent task queue.
///
/// Cheap to clone; all clones share the same store and event bus.
#[derive(Clone)]
pub struct TaskQueue {
    db: Arc<dyn Database>,
    config: QueueConfig,
    retry: RetryPolicy,
    events: EventBus,
}

impl TaskQueue {
    pub fn new(db: Arc<dyn Database>, config: QueueConfig, events: EventBus) -> Self {
        let retry = RetryPolicy::new(config.retry.base_delay, config.retry.max_delay);
        Self {
            db,
            config,
            retry,
            events,
        }
    }

    /// The event bus lifecycle events are published on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Insert a new Pending task.
    ///
    /// When the request carries an idempotency key that is already held by a
    /// live (non-dead-lettered) task, fails with
    /// [`QueueError::DuplicateIdempotencyKey`] carrying that task.
    pub async fn enqueue(&self, req: NewTask) -> Result<Task, QueueError> {
        if let Some(key) = req.idempotency_key.as_deref() {
            if let Some(existing) = self.db.find_active_by_idempotency_key(key).await? {
                debug!(key = key, existing = %existing.id, "Enqueue deduplicated");
                return Err(QueueError::DuplicateIdempotencyKey {
                    key: key.to_string(),
                    existing: Box::new(existing),
                });
            }
        }

        let task = Task::from_request(req, self.config.max_attempts);
        if let Err(e) = self.db.insert_task(&task).await {
            // Two enqueues racing on the same key: the loser hits the unique
            // index, so look the winner up and report it as the duplicate.
            if matches!(e, DatabaseError::Constraint(_)) {
                if let Some(key) = task.idempotency_key.as_deref() {
                    if let Some(existing) = self.db.find_active_by_idempotency_key(key).await? {
                        return Err(QueueError::DuplicateIdempotencyKey {
                            key: key.to_string(),
                            existing: Box::new(existing),
                        });
                    }
                }
            }
            return Err(e.into());
        }

        info!(task_id = %task.id, priority = task.priority, "Task enqueued");
        self.events.publish(QueueEvent::TaskEnqueued {
            task_id: task.id,
            priority: task.priority,
        });
        Ok(task)
    }

    /// Lease the best available task for `worker_id`, or `None` when the
    /// queue has nothing leasable. The lease lasts `lease_duration` from now;
    /// a worker that neither acks nor fails within that window loses the
    /// task to reclaim.
    pub async fn lease(&self, worker_id: &str) -> Result<Option<Task>, QueueError> {
        let now = Utc::now();
        let expires = now + chrono_dur(self.config.lease_duration);
        let leased = self.db.lease_next(worker_id, now, expires).await?;

        if let Some(ref task) = leased {
            self.events.publish(QueueEvent::TaskLeased {
                task_id: task.id,
                owner: worker_id.to_string(),
                attempt: task.attempt_count,
            });
        }
        Ok(leased)
    }

    /// Acknowledge successful completion, transitioning Leased→Succeeded.
    pub async fn ack(
        &self,
        task_id: Uuid,
        worker_id: &str,
        result: Option<String>,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        if self
            .db
            .mark_succeeded(task_id, worker_id, result.as_deref(), now)
            .await?
        {
            info!(task_id = %task_id, worker = worker_id, "Task succeeded");
            self.events.publish(QueueEvent::TaskSucceeded { task_id });
            Ok(())
        } else {
            Err(self.diagnose_guard_miss(task_id, worker_id).await?)
        }
    }

    /// Report a failed attempt. The retry policy decides between a delayed
    /// retry (Leased→Pending with backoff) and the dead letter queue.
    pub async fn fail(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error: &str,
        class: ErrorClass,
    ) -> Result<RetryDecision, QueueError> {
        let now = Utc::now();
        let task = self
            .db
            .get_task(task_id)
            .await?
            .ok_or(QueueError::NotFound { id: task_id })?;

        let decision = self
            .retry
            .decide(class, task.attempt_count, task.max_attempts);

        let applied = match decision {
            RetryDecision::Retry { delay } => {
                let available_at = now + chrono_dur(delay);
                let ok = self
                    .db
                    .mark_retry(task_id, worker_id, available_at, error, class, now)
                    .await?;
                if ok {
                    warn!(
                        task_id = %task_id,
                        attempt = task.attempt_count,
                        delay_secs = delay.as_secs(),
                        error = error,
                        "Task failed, retry scheduled"
                    );
                    self.events.publish(QueueEvent::TaskRetried {
                        task_id,
                        attempt: task.attempt_count,
                        available_at,
                    });
                }
                ok
            }
            RetryDecision::DeadLetter => {
                let ok = self
                    .db
                    .mark_dead_lettered(task_id, worker_id, error, class, now)
                    .await?;
                if ok {
                    warn!(
                        task_id = %task_id,
                        attempt = task.attempt_count,
                        class = %class,
                        error = error,
                        "Task dead-lettered"
                    );
                    self.events.publish(QueueEvent::TaskDeadLettered {
                        task_id,
                        attempt: task.attempt_count,
                    });
                }
                ok
            }
        };

        if applied {
            Ok(decision)
        } else {
            Err(self.diagnose_guard_miss(task_id, worker_id).await?)
        }
    }

    /// Cancel a task that has not started running. Only Pending tasks can be
    /// cancelled; anything else fails with [`QueueError::NotCancellable`].
    pub async fn cancel(&self, task_id: Uuid) -> Result<Task, QueueError> {
        let now = Utc::now();
        if self.db.cancel_task(task_id, now).await? {
            info!(task_id = %task_id, "Task cancelled");
            self.events.publish(QueueEvent::TaskCancelled { task_id });
            self.db
                .get_task(task_id)
                .await?
                .ok_or(QueueError::NotFound { id: task_id })
        } else {
            match self.db.get_task(task_id).await? {
                None => Err(QueueError::NotFound { id: task_id }),
                Some(task) => Err(QueueError::NotCancellable {
                    id: task_id,
                    state: task.state,
                }),
            }
        }
    }

    /// Return every expired lease to Pending, available immediately.
    /// Used by the periodic self-healing sweep.
    pub async fn requeue_abandoned(&self) -> Result<u64, QueueError> {
        let count = self.db.requeue_expired(Utc::now()).await?;
        if count > 0 {
            self.events.publish(QueueEvent::TasksRequeued { count });
        }
        Ok(count)
    }

    /// Force-requeue every task leased by an owner matching `owner_prefix`,
    /// expired or not. Used during shutdown.
    pub async fn requeue_owned(&self, owner_prefix: &str) -> Result<u64, QueueError> {
        let count = self.db.requeue_owned(owner_prefix, Utc::now()).await?;
        if count > 0 {
            self.events.publish(QueueEvent::TasksRequeued { count });
        }
        Ok(count)
    }

    /// Count tasks still leased by an owner matching `owner_prefix`.
    pub async fn count_owned(&self, owner_prefix: &str) -> Result<u64, QueueError> {
        Ok(self.db.count_owned(owner_prefix).await?)
    }

    /// How many tasks a worker could lease right now.
    pub async fn backlog(&self) -> Result<u64, QueueError> {
        Ok(self.db.count_leasable(Utc::now()).await?)
    }

    /// Fetch a single task.
    pub async fn get(&self, task_id: Uuid) -> Result<Option<Task>, QueueError> {
        Ok(self.db.get_task(task_id).await?)
    }

    /// List tasks, most recently created first.
    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, QueueError> {
        Ok(self.db.list_tasks(filter).await?)
    }

    /// Per-state task counts.
    pub async fn counts(&self) -> Result<TaskCounts, QueueError> {
        Ok(self.db.task_counts(Utc::now()).await?)
    }

    /// Work out why a guarded ack/fail update matched no row.
    async fn diagnose_guard_miss(
        &self,
        task_id: Uuid,
        worker_id: &str,
    ) -> Result<QueueError, QueueError> {
        Ok(match self.db.get_task(task_id).await? {
            None => QueueError::NotFound { id: task_id },
            Some(task) => {
                let reclaimed = match task.state {
                    // Someone else holds it now
                    TaskState::Leased => task.lease_owner.as_deref() != Some(worker_id),
                    // It was swept back to pending after our lease expired
                    TaskState::Pending => task.attempt_count > 0,
                    _ => false,
                };
                if reclaimed {
                    QueueError::LeaseExpired { id: task_id }
                } else {
                    QueueError::NotLeased {
                        id: task_id,
                        state: task.state,
                    }
                }
            }
        })
    }
}

fn chrono_dur(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
