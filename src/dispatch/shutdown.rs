//! Shutdown coordinator.
//!
//! Drain sequence: leasing already stopped by the caller, wait up to the
//! grace period for in-flight tasks to report, abort the rest, then hand
//! every lease still owned by this instance back to the queue. Exits only
//! once the store confirms nothing is owned here anymore.

use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::DispatchError;
use crate::queue::TaskQueue;

pub struct ShutdownCoordinator {
    grace_period: Duration,
    queue: TaskQueue,
    owner_prefix: String,
}

impl ShutdownCoordinator {
    pub fn new(grace_period: Duration, queue: TaskQueue, owner_prefix: String) -> Self {
        Self {
            grace_period,
            queue,
            owner_prefix,
        }
    }

    /// Wait for the workers, then reconcile ownership with the queue.
    pub async fn drain(&self, mut handles: Vec<JoinHandle<()>>) -> Result<(), DispatchError> {
        info!(
            workers = handles.len(),
            grace_secs = self.grace_period.as_secs_f64(),
            "Waiting for in-flight tasks"
        );

        let all_done = timeout(self.grace_period, join_all(handles.iter_mut()))
            .await
            .is_ok();
        if !all_done {
            warn!("Grace period expired, aborting remaining workers");
            for handle in &handles {
                handle.abort();
            }
        }

        let requeued = self.queue.requeue_owned(&self.owner_prefix).await?;
        if requeued > 0 {
            info!(count = requeued, "Requeued tasks abandoned at shutdown");
        }

        // A lease grant may have been in flight when a worker was aborted;
        // re-sweep until the store shows a clean slate.
        for _ in 0..3 {
            let owned = self.queue.count_owned(&self.owner_prefix).await?;
            if owned == 0 {
                info!("Shutdown complete, no leases owned by this instance");
                return Ok(());
            }
            warn!(owned, "Leases still owned after requeue, sweeping again");
            self.queue.requeue_owned(&self.owner_prefix).await?;
        }

        let owned = self.queue.count_owned(&self.owner_prefix).await?;
        if owned == 0 {
            info!("Shutdown complete, no leases owned by this instance");
            Ok(())
        } else {
            Err(DispatchError::ShutdownIncomplete { owned })
        }
    }
}
