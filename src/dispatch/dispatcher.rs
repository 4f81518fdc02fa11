//! Worker-pool dispatcher.
//!
//! Owns a dynamically sized set of workers, each looping lease → run →
//! ack/fail against the shared queue. A manager tick reaps dead workers,
//! sweeps expired leases back to Pending, and resizes the pool between
//! `min_concurrency` and `max_concurrency` based on backlog pressure.
//!
//! All cross-worker coordination goes through the store; workers share no
//! locks with each other, only the atomic pool controls in [`WorkerShared`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, QueueError};
use crate::queue::{Task, TaskQueue};
use crate::retry::ErrorClass;

use super::runner::TaskRunner;
use super::shutdown::ShutdownCoordinator;

/// Tracked worker handle.
struct TrackedWorker {
    handle: JoinHandle<()>,
}

/// State shared between the manager tick and every worker loop.
struct WorkerShared {
    queue: TaskQueue,
    runner: Arc<dyn TaskRunner>,
    poll_interval: Duration,
    /// Set at shutdown; workers stop leasing and exit at the next safe point.
    draining: AtomicBool,
    /// How many workers should exit to reach the target pool size.
    scale_down_debt: AtomicUsize,
    /// Total leases granted by this instance, for idle detection.
    leases_granted: AtomicU64,
}

/// Manager-loop bookkeeping carried between ticks.
struct TickState {
    idle_ticks: u32,
    last_leases: u64,
    last_reclaim: tokio::time::Instant,
}

/// Leases tasks to a bounded pool of concurrent workers.
pub struct Dispatcher {
    config: DispatcherConfig,
    shared: Arc<WorkerShared>,
    instance_id: String,
    workers: Arc<RwLock<HashMap<u64, TrackedWorker>>>,
    next_seq: AtomicU64,
    /// Desired pool size; the manager resizes toward it each tick.
    target: AtomicUsize,
    running: AtomicBool,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, queue: TaskQueue, runner: Arc<dyn TaskRunner>) -> Self {
        let instance_id = format!("disp-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let shared = Arc::new(WorkerShared {
            queue,
            runner,
            poll_interval: config.poll_interval,
            draining: AtomicBool::new(false),
            scale_down_debt: AtomicUsize::new(0),
            leases_granted: AtomicU64::new(0),
        });
        Self {
            config,
            shared,
            instance_id,
            workers: Arc::new(RwLock::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
            target: AtomicUsize::new(0),
            running: AtomicBool::new(false),
        }
    }

    /// Unique id for this dispatcher process; every lease owner string
    /// starts with `{instance_id}/`.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Lease-owner prefix shared by all workers of this instance.
    pub fn owner_prefix(&self) -> String {
        format!("{}/", self.instance_id)
    }

    /// Desired pool size.
    pub fn target(&self) -> usize {
        self.target.load(Ordering::SeqCst)
    }

    /// Workers currently tracked (live or awaiting reap).
    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Run the manager loop until shut down or the store gives up.
    ///
    /// Store errors are tolerated per tick; after `max_store_failures`
    /// consecutive failing ticks this returns `StoreUnavailable`.
    pub async fn run(&self) -> Result<(), DispatchError> {
        self.run_inner(false).await
    }

    /// Like [`run`](Self::run), but stops once no task is pending or leased,
    /// drains the pool, and returns. For batch usage and tests.
    pub async fn run_until_drained(&self) -> Result<(), DispatchError> {
        self.run_inner(true).await?;
        self.shutdown().await
    }

    async fn run_inner(&self, stop_when_empty: bool) -> Result<(), DispatchError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DispatchError::AlreadyRunning);
        }

        // Sweep leases abandoned by a previous instance before workers start
        // polling; the periodic reclaim pass repeats this every
        // reclaim_interval.
        match self.shared.queue.requeue_abandoned().await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Recovered abandoned tasks at startup"),
            Err(e) => warn!("Startup lease sweep failed: {e}"),
        }

        let initial = self
            .config
            .default_concurrency
            .clamp(self.config.min_concurrency, self.config.max_concurrency);
        self.target.store(initial, Ordering::SeqCst);
        for _ in 0..initial {
            self.spawn_worker().await;
        }
        info!(
            instance = %self.instance_id,
            workers = initial,
            autoscale = self.config.autoscale.enabled,
            "Dispatcher started"
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        // Skip immediate first tick
        ticker.tick().await;

        let mut state = TickState {
            idle_ticks: 0,
            last_leases: 0,
            last_reclaim: tokio::time::Instant::now(),
        };
        let mut store_failures: u32 = 0;

        loop {
            ticker.tick().await;
            if self.shared.draining.load(Ordering::SeqCst) {
                return Ok(());
            }

            match self.tick(&mut state).await {
                Ok(()) => {
                    store_failures = 0;
                    if stop_when_empty && self.queue_is_empty().await {
                        info!(instance = %self.instance_id, "Queue drained, stopping");
                        return Ok(());
                    }
                }
                Err(e) => {
                    store_failures += 1;
                    if store_failures >= self.config.max_store_failures {
                        error!(
                            consecutive = store_failures,
                            "Dispatcher store unavailable, giving up: {e}"
                        );
                        return Err(DispatchError::StoreUnavailable {
                            consecutive: store_failures,
                        });
                    }
                    warn!(consecutive = store_failures, "Dispatcher tick failed: {e}");
                }
            }
        }
    }

    /// Nothing left to run now or later: no pending (even delayed) and no
    /// leased task remains.
    async fn queue_is_empty(&self) -> bool {
        match self.shared.queue.counts().await {
            Ok(counts) => counts.pending == 0 && counts.leased == 0,
            Err(_) => false,
        }
    }

    /// Drain the pool and hand every still-owned lease back to the queue.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        info!(instance = %self.instance_id, "Dispatcher shutting down");
        self.shared.draining.store(true, Ordering::SeqCst);

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.write().await;
            workers.drain().map(|(_, w)| w.handle).collect()
        };

        let coordinator = ShutdownCoordinator::new(
            self.config.grace_period,
            self.shared.queue.clone(),
            self.owner_prefix(),
        );
        coordinator.drain(handles).await
    }

    /// One manager tick: reap, reclaim, autoscale, resize.
    async fn tick(&self, state: &mut TickState) -> Result<(), QueueError> {
        self.reap_workers().await;

        if state.last_reclaim.elapsed() >= self.config.reclaim_interval {
            let requeued = self.shared.queue.requeue_abandoned().await?;
            if requeued > 0 {
                info!(count = requeued, "Requeued tasks with expired leases");
            }
            state.last_reclaim = tokio::time::Instant::now();
        }

        self.autoscale(state).await?;
        self.resize_pool().await;
        Ok(())
    }

    /// Remove finished workers from the pool, logging panics. Replacements
    /// are spawned by the next `resize_pool` pass.
    async fn reap_workers(&self) {
        let mut workers = self.workers.write().await;
        let finished: Vec<u64> = workers
            .iter()
            .filter(|(_, w)| w.handle.is_finished())
            .map(|(seq, _)| *seq)
            .collect();
        for seq in finished {
            if let Some(worker) = workers.remove(&seq) {
                match worker.handle.await {
                    Ok(()) => debug!(seq, "Worker exited"),
                    Err(e) if e.is_panic() => {
                        warn!(seq, "Worker panicked, replacing: {e}");
                    }
                    Err(e) => warn!(seq, "Worker join failed: {e}"),
                }
            }
        }
    }

    /// Move the target by at most one step per tick.
    async fn autoscale(&self, state: &mut TickState) -> Result<(), QueueError> {
        let granted = self.shared.leases_granted.load(Ordering::Relaxed);
        let idle = granted == state.last_leases;
        state.last_leases = granted;

        if !self.config.autoscale.enabled {
            return Ok(());
        }

        let backlog = self.shared.queue.backlog().await?;
        let target = self.target.load(Ordering::SeqCst);

        if scale_up_needed(
            backlog,
            target,
            self.config.autoscale.scale_up_pending_per_worker,
        ) {
            if target < self.config.max_concurrency {
                self.target.store(target + 1, Ordering::SeqCst);
                info!(workers = target + 1, backlog, "Scaling up");
            }
            state.idle_ticks = 0;
        } else if idle {
            state.idle_ticks += 1;
            if state.idle_ticks >= self.config.autoscale.scale_down_idle_cycles {
                if target > self.config.min_concurrency {
                    self.target.store(target - 1, Ordering::SeqCst);
                    debug!(workers = target - 1, "Scaling down idle pool");
                }
                state.idle_ticks = 0;
            }
        } else {
            state.idle_ticks = 0;
        }
        Ok(())
    }

    /// Spawn or retire workers until the live pool matches the target.
    async fn resize_pool(&self) {
        let target = self.target.load(Ordering::SeqCst);
        let live = self.workers.read().await.len();

        let excess = live.saturating_sub(target);
        self.shared.scale_down_debt.store(excess, Ordering::SeqCst);

        for _ in live..target {
            self.spawn_worker().await;
        }
    }

    async fn spawn_worker(&self) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let worker_id = format!("{}/worker-{}", self.instance_id, seq);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(worker_loop(shared, worker_id));
        self.workers.write().await.insert(seq, TrackedWorker { handle });
    }
}

/// `pending / workers > per_worker`, kept in multiplied form so integer
/// division can't hide pressure.
fn scale_up_needed(backlog: u64, workers: usize, per_worker: u32) -> bool {
    backlog > per_worker as u64 * workers as u64
}

/// One worker: lease, run, report, repeat.
async fn worker_loop(shared: Arc<WorkerShared>, worker_id: String) {
    debug!(worker = %worker_id, "Worker started");
    loop {
        if shared.draining.load(Ordering::SeqCst) {
            break;
        }
        if take_scale_down(&shared.scale_down_debt) {
            debug!(worker = %worker_id, "Worker retired by scale-down");
            break;
        }

        match shared.queue.lease(&worker_id).await {
            Ok(Some(task)) => {
                shared.leases_granted.fetch_add(1, Ordering::Relaxed);
                execute_task(&shared, &worker_id, task).await;
            }
            Ok(None) => {
                tokio::time::sleep(shared.poll_interval).await;
            }
            Err(e) => {
                warn!(worker = %worker_id, "Lease attempt failed: {e}");
                tokio::time::sleep(shared.poll_interval).await;
            }
        }
    }
    debug!(worker = %worker_id, "Worker stopped");
}

/// Claim one unit of scale-down debt; the claimer exits.
fn take_scale_down(debt: &AtomicUsize) -> bool {
    debt.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1))
        .is_ok()
}

/// Run one leased task and report the outcome.
///
/// Runner panics are contained to the attempt and reported as transient
/// failures. A lease lost mid-run means the result is discarded; the
/// reclaiming side owns the task now.
async fn execute_task(shared: &Arc<WorkerShared>, worker_id: &str, task: Task) {
    let task_id = task.id;
    debug!(
        worker = %worker_id,
        task_id = %task_id,
        attempt = task.attempt_count,
        "Running task"
    );

    let runner = Arc::clone(&shared.runner);
    let run_task = task.clone();
    let outcome = tokio::spawn(async move { runner.run(&run_task).await }).await;

    let report = match outcome {
        Ok(Ok(result)) => shared
            .queue
            .ack(task_id, worker_id, result)
            .await
            .map(|_| ()),
        Ok(Err(failure)) => shared
            .queue
            .fail(task_id, worker_id, &failure.message, failure.class)
            .await
            .map(|_| ()),
        Err(join_err) => {
            let message = format!("task runner panicked: {join_err}");
            shared
                .queue
                .fail(task_id, worker_id, &message, ErrorClass::Transient)
                .await
                .map(|_| ())
        }
    };

    match report {
        Ok(()) => {}
        Err(QueueError::LeaseExpired { .. }) => {
            warn!(
                worker = %worker_id,
                task_id = %task_id,
                "Lease lost before completion, result discarded"
            );
        }
        Err(e) => {
            warn!(worker = %worker_id, task_id = %task_id, "Failed to report outcome: {e}");
        }
    }
}
