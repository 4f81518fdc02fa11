//! Schedule engine.
//!
//! Polls the schedule store on a fixed tick, enqueues a task for every due
//! schedule, and advances `next_fire_at`. Each firing carries a derived
//! idempotency key, so a crash between enqueue and bookkeeping cannot
//! produce a duplicate task on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{QueueError, ScheduleError};
use crate::events::QueueEvent;
use crate::queue::{NewTask, TaskQueue};
use crate::store::traits::Database;

use super::model::{NewSchedule, Schedule};
use super::trigger::Trigger;

/// Fires due schedules into the task queue.
pub struct Scheduler {
    config: SchedulerConfig,
    db: Arc<dyn Database>,
    queue: TaskQueue,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, db: Arc<dyn Database>, queue: TaskQueue) -> Self {
        Self { config, db, queue }
    }

    /// Register a new schedule. The first fire time is computed here; a
    /// one-shot trigger whose time already passed fires on the next tick.
    pub async fn add(&self, req: NewSchedule) -> Result<Schedule, ScheduleError> {
        let schedule = Schedule::from_request(req, Utc::now())?;
        self.db.insert_schedule(&schedule).await?;
        info!(
            schedule_id = %schedule.id,
            name = %schedule.name,
            trigger = schedule.trigger.type_tag(),
            next_fire = ?schedule.next_fire_at,
            "Schedule registered"
        );
        Ok(schedule)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Schedule>, ScheduleError> {
        Ok(self.db.get_schedule(id).await?)
    }

    pub async fn list(&self, include_inactive: bool) -> Result<Vec<Schedule>, ScheduleError> {
        Ok(self.db.list_schedules(include_inactive).await?)
    }

    /// Deactivate a schedule so it never fires again. Already-enqueued tasks
    /// are unaffected.
    pub async fn cancel(&self, id: Uuid) -> Result<(), ScheduleError> {
        if self.db.set_schedule_active(id, false).await? {
            info!(schedule_id = %id, "Schedule cancelled");
            Ok(())
        } else {
            Err(ScheduleError::NotFound { id })
        }
    }

    /// Run the tick loop until the task is dropped.
    ///
    /// Store errors are retried with backoff; after `max_store_failures`
    /// consecutive failures the loop gives up and returns the error.
    pub async fn run(&self) -> Result<(), ScheduleError> {
        info!(
            tick = ?self.config.tick_interval,
            "Scheduler started"
        );
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        // Skip immediate first tick
        ticker.tick().await;

        let mut consecutive: u32 = 0;
        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(_) => consecutive = 0,
                Err(e) => {
                    consecutive += 1;
                    if consecutive >= self.config.max_store_failures {
                        error!(consecutive, "Scheduler store unavailable, giving up: {e}");
                        return Err(ScheduleError::StoreUnavailable { consecutive });
                    }
                    let pause = store_retry_pause(consecutive);
                    warn!(
                        consecutive,
                        retry_in_ms = pause.as_millis() as u64,
                        "Scheduler tick failed: {e}"
                    );
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    /// One tick against the current clock.
    pub async fn tick(&self) -> Result<usize, ScheduleError> {
        self.tick_at(Utc::now()).await
    }

    /// Fire every schedule due at `now`. Returns the number fired.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<usize, ScheduleError> {
        let due = self.db.list_due_schedules(now).await?;
        let mut fired = 0;

        for schedule in due {
            // Selected as due, so the fire time is present
            let Some(fire_at) = schedule.next_fire_at else {
                continue;
            };
            self.fire(&schedule, fire_at, now).await?;
            fired += 1;
        }
        Ok(fired)
    }

    /// Enqueue one firing of `schedule` and advance its bookkeeping.
    async fn fire(
        &self,
        schedule: &Schedule,
        fire_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        let req = {
            let mut req = NewTask::new(schedule.task_payload.clone())
                .with_idempotency_key(schedule.fire_key(fire_at))
                .with_priority(schedule.task_priority);
            if let Some(max) = schedule.task_max_attempts {
                req = req.with_max_attempts(max);
            }
            req
        };

        match self.queue.enqueue(req).await {
            Ok(task) => {
                info!(
                    schedule_id = %schedule.id,
                    name = %schedule.name,
                    task_id = %task.id,
                    "Schedule fired"
                );
                self.queue.events().publish(QueueEvent::ScheduleFired {
                    schedule_id: schedule.id,
                    task_id: task.id,
                });
            }
            // A previous tick enqueued this firing but crashed before the
            // bookkeeping landed. Finish the bookkeeping now.
            Err(QueueError::DuplicateIdempotencyKey { existing, .. }) => {
                debug!(
                    schedule_id = %schedule.id,
                    task_id = %existing.id,
                    "Firing already enqueued, advancing schedule"
                );
            }
            Err(e) => return Err(e.into()),
        }

        let runs = schedule.run_count + 1;
        let capped = schedule.max_runs.is_some_and(|max| runs >= max);
        // Cron always repeats, advancing from the tick clock (missed slots
        // are skipped). A relative trigger repeats only on request and
        // measures its offset from the fire it just served; an absolute
        // trigger is one-shot.
        let (repeats, base) = match schedule.trigger {
            Trigger::Cron { .. } => (true, now),
            Trigger::In { .. } => (schedule.recurring, fire_at),
            Trigger::At { .. } => (false, now),
        };
        let next = if capped || !repeats {
            None
        } else {
            match schedule
                .tz()
                .and_then(|tz| schedule.trigger.next_fire_after(base, tz))
            {
                Ok(next) => next,
                // A schedule whose trigger can no longer be evaluated would
                // wedge every future tick. Park it instead.
                Err(e) => {
                    error!(schedule_id = %schedule.id, "Cannot compute next fire, deactivating: {e}");
                    None
                }
            }
        };
        let active = next.is_some();

        self.db
            .record_schedule_fire(schedule.id, fire_at, next, active)
            .await?;
        Ok(())
    }
}

/// Pause before retrying a failed tick, growing with the failure streak.
fn store_retry_pause(consecutive: u32) -> Duration {
    let base = Duration::from_millis(500) * consecutive;
    let jitter = rand::thread_rng().gen_range(0..250);
    base + Duration::from_millis(jitter)
}
