//! Integration tests for the queue, dispatcher, and scheduler working
//! against a real libsql store.
//!
//! Each test wires the full stack through the public API; nothing reaches
//! into the store directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::timeout;

use conveyor::config::{AutoscaleConfig, DispatcherConfig, QueueConfig, RetryConfig, SchedulerConfig};
use conveyor::dispatch::{Dispatcher, TaskFailure, TaskRunner};
use conveyor::events::EventBus;
use conveyor::queue::{NewTask, Task, TaskQueue, TaskState};
use conveyor::schedule::{NewSchedule, Scheduler, Trigger};
use conveyor::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Queue tuned so retries are leasable immediately.
fn fast_queue_config() -> QueueConfig {
    QueueConfig {
        max_attempts: 3,
        lease_duration: Duration::from_secs(30),
        retry: RetryConfig {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
    }
}

/// Dispatcher tuned for test speed: small pool, 10ms polls, short grace.
fn fast_dispatcher_config(workers: usize) -> DispatcherConfig {
    DispatcherConfig {
        default_concurrency: workers,
        min_concurrency: workers,
        max_concurrency: workers,
        autoscale: AutoscaleConfig {
            enabled: false,
            ..AutoscaleConfig::default()
        },
        tick_interval: Duration::from_millis(20),
        poll_interval: Duration::from_millis(10),
        reclaim_interval: Duration::from_millis(50),
        grace_period: Duration::from_millis(100),
        max_store_failures: 5,
    }
}

async fn memory_stack(workers: usize, runner: Arc<dyn TaskRunner>) -> (TaskQueue, Arc<Dispatcher>) {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let queue = TaskQueue::new(db, fast_queue_config(), EventBus::new());
    let dispatcher = Arc::new(Dispatcher::new(
        fast_dispatcher_config(workers),
        queue.clone(),
        runner,
    ));
    (queue, dispatcher)
}

fn start(dispatcher: &Arc<Dispatcher>) {
    let dispatcher = Arc::clone(dispatcher);
    tokio::spawn(async move { dispatcher.run().await });
}

/// Poll `check` every 10ms until it passes.
async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    loop {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Stub runners ─────────────────────────────────────────────────────

/// Records every payload it executes, in order.
struct RecordingRunner {
    seen: Mutex<Vec<Value>>,
}

impl RecordingRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TaskRunner for RecordingRunner {
    async fn run(&self, task: &Task) -> Result<Option<String>, TaskFailure> {
        self.seen.lock().await.push(task.payload.clone());
        Ok(Some("done".to_string()))
    }
}

/// Fails each task's first attempt, succeeds afterwards.
struct FlakyRunner {
    failures: Mutex<HashMap<uuid::Uuid, u32>>,
}

impl FlakyRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl TaskRunner for FlakyRunner {
    async fn run(&self, task: &Task) -> Result<Option<String>, TaskFailure> {
        let mut failures = self.failures.lock().await;
        let count = failures.entry(task.id).or_insert(0);
        if *count == 0 {
            *count += 1;
            return Err(TaskFailure::transient("first attempt always fails"));
        }
        Ok(Some("recovered".to_string()))
    }
}

/// Always fails with a retryable class.
struct FailingRunner;

#[async_trait]
impl TaskRunner for FailingRunner {
    async fn run(&self, _task: &Task) -> Result<Option<String>, TaskFailure> {
        Err(TaskFailure::timeout("handler deadline exceeded"))
    }
}

/// Holds its lease far beyond any grace period.
struct StallingRunner;

#[async_trait]
impl TaskRunner for StallingRunner {
    async fn run(&self, _task: &Task) -> Result<Option<String>, TaskFailure> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(None)
    }
}

// ── Dispatch flow ────────────────────────────────────────────────────

#[tokio::test]
async fn enqueue_dispatch_ack_end_to_end() {
    timeout(TEST_TIMEOUT, async {
        let runner = RecordingRunner::new();
        let (queue, dispatcher) = memory_stack(2, runner.clone()).await;

        let mut ids = Vec::new();
        for n in 0..3 {
            let task = queue
                .enqueue(NewTask::new(serde_json::json!({"n": n})))
                .await
                .unwrap();
            ids.push(task.id);
        }

        start(&dispatcher);
        wait_until(|| {
            let queue = queue.clone();
            async move { queue.counts().await.unwrap().succeeded == 3 }
        })
        .await;

        for id in ids {
            let task = queue.get(id).await.unwrap().unwrap();
            assert_eq!(task.state, TaskState::Succeeded);
            assert_eq!(task.attempt_count, 1);
            assert_eq!(task.result.as_deref(), Some("done"));
        }
        assert_eq!(runner.seen.lock().await.len(), 3);

        dispatcher.shutdown().await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn single_worker_executes_in_priority_order() {
    timeout(TEST_TIMEOUT, async {
        let runner = RecordingRunner::new();
        let (queue, dispatcher) = memory_stack(1, runner.clone()).await;

        // Enqueued out of order before any worker exists
        for (label, priority) in [("low", 0), ("high", 9), ("mid", 5)] {
            queue
                .enqueue(NewTask::new(serde_json::json!({"label": label})).with_priority(priority))
                .await
                .unwrap();
        }

        start(&dispatcher);
        wait_until(|| {
            let queue = queue.clone();
            async move { queue.counts().await.unwrap().succeeded == 3 }
        })
        .await;

        let seen = runner.seen.lock().await;
        let labels: Vec<&str> = seen.iter().map(|p| p["label"].as_str().unwrap()).collect();
        assert_eq!(labels, vec!["high", "mid", "low"]);

        dispatcher.shutdown().await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn transient_failure_retries_and_recovers() {
    timeout(TEST_TIMEOUT, async {
        let (queue, dispatcher) = memory_stack(1, FlakyRunner::new()).await;
        let task = queue
            .enqueue(NewTask::new(serde_json::json!({"job": "flaky"})))
            .await
            .unwrap();

        start(&dispatcher);
        wait_until(|| {
            let queue = queue.clone();
            async move { queue.counts().await.unwrap().succeeded == 1 }
        })
        .await;

        let done = queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(done.state, TaskState::Succeeded);
        assert_eq!(done.attempt_count, 2);
        assert_eq!(done.result.as_deref(), Some("recovered"));
        // The failed attempt stays on the record
        assert_eq!(done.last_error.as_deref(), Some("first attempt always fails"));

        dispatcher.shutdown().await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn exhausted_retries_keep_an_audit_trail() {
    timeout(TEST_TIMEOUT, async {
        let (queue, dispatcher) = memory_stack(1, Arc::new(FailingRunner)).await;
        let task = queue
            .enqueue(NewTask::new(serde_json::json!({"job": "doomed"})).with_max_attempts(2))
            .await
            .unwrap();

        start(&dispatcher);
        wait_until(|| {
            let queue = queue.clone();
            async move { queue.counts().await.unwrap().dead_lettered == 1 }
        })
        .await;

        let dead = queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(dead.state, TaskState::DeadLettered);
        assert_eq!(dead.attempt_count, 2);
        assert_eq!(dead.last_error.as_deref(), Some("handler deadline exceeded"));
        assert_eq!(
            dead.last_error_class,
            Some(conveyor::retry::ErrorClass::Timeout)
        );

        dispatcher.shutdown().await.unwrap();
    })
    .await
    .expect("test timed out");
}

// ── Shutdown and recovery ────────────────────────────────────────────

#[tokio::test]
async fn shutdown_hands_inflight_work_to_the_next_instance() {
    timeout(TEST_TIMEOUT, async {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = TaskQueue::new(db, fast_queue_config(), EventBus::new());

        for n in 0..2 {
            queue
                .enqueue(NewTask::new(serde_json::json!({"n": n})))
                .await
                .unwrap();
        }

        // First instance stalls on both tasks and is torn down mid-flight
        let stalled = Arc::new(Dispatcher::new(
            fast_dispatcher_config(2),
            queue.clone(),
            Arc::new(StallingRunner),
        ));
        start(&stalled);
        wait_until(|| {
            let queue = queue.clone();
            async move { queue.counts().await.unwrap().leased == 2 }
        })
        .await;

        stalled.shutdown().await.unwrap();
        assert_eq!(queue.count_owned(&stalled.owner_prefix()).await.unwrap(), 0);

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.leased, 0);

        // A fresh instance picks the work up; the aborted attempt is on record
        let fresh = Arc::new(Dispatcher::new(
            fast_dispatcher_config(2),
            queue.clone(),
            RecordingRunner::new(),
        ));
        start(&fresh);
        wait_until(|| {
            let queue = queue.clone();
            async move { queue.counts().await.unwrap().succeeded == 2 }
        })
        .await;

        let done = queue
            .list(&conveyor::store::TaskFilter::state(TaskState::Succeeded))
            .await
            .unwrap();
        for task in done {
            assert_eq!(task.attempt_count, 2);
        }

        fresh.shutdown().await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn tasks_survive_a_process_restart_on_disk() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("conveyor.db");

        // "First process": enqueue, then lease with an instantly expiring
        // lease and drop everything without acking.
        let first_id = {
            let db: Arc<dyn Database> =
                Arc::new(LibSqlBackend::new_local(&db_path).await.unwrap());
            let config = QueueConfig {
                lease_duration: Duration::ZERO,
                ..fast_queue_config()
            };
            let queue = TaskQueue::new(db, config, EventBus::new());
            let task = queue
                .enqueue(NewTask::new(serde_json::json!({"job": "durable"})))
                .await
                .unwrap();
            queue.lease("crashed/worker-0").await.unwrap().unwrap();
            task.id
        };

        // "Second process": reopen the same file, sweep abandoned leases,
        // dispatch to completion.
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&db_path).await.unwrap());
        let queue = TaskQueue::new(db, fast_queue_config(), EventBus::new());
        assert_eq!(queue.requeue_abandoned().await.unwrap(), 1);

        let dispatcher = Arc::new(Dispatcher::new(
            fast_dispatcher_config(1),
            queue.clone(),
            RecordingRunner::new(),
        ));
        start(&dispatcher);
        wait_until(|| {
            let queue = queue.clone();
            async move { queue.counts().await.unwrap().succeeded == 1 }
        })
        .await;

        let done = queue.get(first_id).await.unwrap().unwrap();
        assert_eq!(done.state, TaskState::Succeeded);
        assert_eq!(done.attempt_count, 2);

        dispatcher.shutdown().await.unwrap();
    })
    .await
    .expect("test timed out");
}

// ── Scheduler flow ───────────────────────────────────────────────────

#[tokio::test]
async fn scheduled_firing_flows_through_the_dispatcher() {
    timeout(TEST_TIMEOUT, async {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = TaskQueue::new(db.clone(), fast_queue_config(), EventBus::new());
        let scheduler = Scheduler::new(SchedulerConfig::default(), db, queue.clone());

        let past = chrono::Utc::now() - chrono::Duration::minutes(1);
        let added = scheduler
            .add(
                NewSchedule::new(
                    Trigger::At { timestamp: past },
                    serde_json::json!({"job": "scheduled"}),
                )
                .with_name("one-off"),
            )
            .await
            .unwrap();

        assert_eq!(scheduler.tick().await.unwrap(), 1);

        let runner = RecordingRunner::new();
        let dispatcher = Arc::new(Dispatcher::new(
            fast_dispatcher_config(1),
            queue.clone(),
            runner.clone(),
        ));
        start(&dispatcher);
        wait_until(|| {
            let queue = queue.clone();
            async move { queue.counts().await.unwrap().succeeded == 1 }
        })
        .await;

        assert_eq!(
            runner.seen.lock().await.as_slice(),
            &[serde_json::json!({"job": "scheduled"})]
        );

        // Fired once, now inert
        let after = scheduler.get(added.id).await.unwrap().unwrap();
        assert!(!after.active);
        assert_eq!(scheduler.tick().await.unwrap(), 0);

        dispatcher.shutdown().await.unwrap();
    })
    .await
    .expect("test timed out");
}
