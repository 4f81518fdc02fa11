//! Queue lifecycle events.
//!
//! The queue and dispatcher publish events over a broadcast channel so
//! observers (CLI tails, tests, future APIs) can follow task lifecycles
//! without polling the store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Something observable happened to a task or schedule.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    TaskEnqueued {
        task_id: Uuid,
        priority: i64,
    },
    TaskLeased {
        task_id: Uuid,
        owner: String,
        attempt: u32,
    },
    TaskSucceeded {
        task_id: Uuid,
    },
    /// A failed attempt that will run again after the backoff delay.
    TaskRetried {
        task_id: Uuid,
        attempt: u32,
        available_at: DateTime<Utc>,
    },
    TaskDeadLettered {
        task_id: Uuid,
        attempt: u32,
    },
    TaskCancelled {
        task_id: Uuid,
    },
    /// Expired or orphaned leases were returned to the pending set.
    TasksRequeued {
        count: u64,
    },
    ScheduleFired {
        schedule_id: Uuid,
        task_id: Uuid,
    },
}

/// Fan-out channel for [`QueueEvent`]s.
///
/// Cloning is cheap; all clones share the same underlying channel. Slow
/// subscribers that fall more than the channel capacity behind see
/// `RecvError::Lagged` and skip ahead, they never block publishers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: QueueEvent) {
        // Ok if there are no subscribers.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
