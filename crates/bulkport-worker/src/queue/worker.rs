use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handle::PgJobHandle;
use super::store::{FailDisposition, PgJobQueue};
use super::{ClaimedJob, JobStatus, Result};
use crate::bulk::{BulkRequestService, JobHandle, JobOutcome};
use crate::config::WorkerConfig;
use crate::lock::PgLockStore;

/// Claims and runs work units until shut down
pub struct QueueWorker {
    worker_id: Uuid,
    queue: PgJobQueue,
    service: Arc<BulkRequestService>,
    config: WorkerConfig,
}

impl QueueWorker {
    pub fn new(queue: PgJobQueue, service: Arc<BulkRequestService>, config: WorkerConfig) -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            queue,
            service,
            config,
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker_id = %self.worker_id, "Queue worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.queue.claim(self.worker_id).await {
                Ok(Some(claimed)) => {
                    // A claimed unit always runs to its end; shutdown waits for it
                    if let Err(e) = self.process(claimed).await {
                        error!(worker_id = %self.worker_id, error = %e, "Failed to record work unit result");
                    }
                },
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.config.poll_interval()) => {},
                    }
                },
                Err(e) => {
                    warn!(worker_id = %self.worker_id, error = %e, "Failed to claim work unit");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.config.poll_interval()) => {},
                    }
                },
            }
        }

        info!(worker_id = %self.worker_id, "Queue worker stopped");
    }

    /// Start heartbeat task for a work unit
    fn start_heartbeat_task(&self, job_id: Uuid) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let every = Duration::from_secs(self.config.heartbeat_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(e) = queue.heartbeat(job_id).await {
                    warn!(job_id = %job_id, error = %e, "Work unit heartbeat failed");
                }
            }
        })
    }

    async fn process(&self, claimed: ClaimedJob) -> Result<()> {
        let ClaimedJob {
            id,
            job,
            attempts,
            max_attempts,
        } = claimed;
        info!(
            job_id = %id,
            request_id = %job.request_id,
            event = %job.event_type,
            attempts,
            max_attempts,
            "Work unit claimed"
        );

        let heartbeat = self.start_heartbeat_task(id);
        let handle: Arc<dyn JobHandle> = Arc::new(PgJobHandle::new(self.queue.clone(), id));
        let result = self.service.dispatch(&job, handle.clone()).await;
        heartbeat.abort();

        match result {
            Ok(JobOutcome::Completed) | Ok(JobOutcome::Deferred) | Ok(JobOutcome::Skipped(_)) => {
                self.queue.finish(id, JobStatus::Completed, None).await?;
                debug!(job_id = %id, "Work unit completed");
            },
            Ok(JobOutcome::Cancelled) => {
                self.queue.finish(id, JobStatus::Cancelled, None).await?;
            },
            // The request is already FAILED; another attempt would only repeat it
            Ok(JobOutcome::Failed(message)) => {
                self.queue
                    .finish(id, JobStatus::Failed, Some(&message))
                    .await?;
            },
            Err(e) => {
                let message = e.to_string();
                if let FailDisposition::Exhausted { .. } = self.queue.fail(id, &message).await? {
                    self.service
                        .handle_job_failure(&job, handle, &message)
                        .await?;
                }
            },
        }
        Ok(())
    }
}

/// Periodic queue housekeeping: stalls, pending cancellations, purge
pub struct Maintenance {
    queue: PgJobQueue,
    service: Arc<BulkRequestService>,
    config: WorkerConfig,
    locks: Option<PgLockStore>,
}

impl Maintenance {
    pub fn new(queue: PgJobQueue, service: Arc<BulkRequestService>, config: WorkerConfig) -> Self {
        Self {
            queue,
            service,
            config,
            locks: None,
        }
    }

    /// Also delete long-expired lock rows
    pub fn with_lock_purge(mut self, locks: PgLockStore) -> Self {
        self.locks = Some(locks);
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let every = Duration::from_secs(self.config.heartbeat_secs.max(1));
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Queue maintenance pass failed");
                    }
                }
            }
        }
    }

    /// One maintenance pass
    pub async fn tick(&self) -> Result<()> {
        let stall_timeout = Duration::from_secs(self.config.stall_timeout_secs);
        for stalled in self.queue.reclaim_stale(stall_timeout).await? {
            if !stalled.exhausted {
                continue;
            }
            let handle: Arc<dyn JobHandle> =
                Arc::new(PgJobHandle::new(self.queue.clone(), stalled.id));
            if let Err(e) = self.service.handle_job_stalled(&stalled.job, handle).await {
                warn!(job_id = %stalled.id, error = %e, "Failed to reconcile stalled request");
            }
        }

        for (id, job) in self.queue.claim_cancelled().await? {
            let handle: Arc<dyn JobHandle> = Arc::new(PgJobHandle::new(self.queue.clone(), id));
            if let Err(e) = self.service.handle_job_cancellation(&job, handle).await {
                warn!(job_id = %id, error = %e, "Failed to reconcile cancelled request");
            }
        }

        let purged = self.queue.purge_finished().await?;
        if purged > 0 {
            info!(purged, "Purged finished work units");
        }

        if let Some(locks) = &self.locks {
            match locks.purge_expired(stall_timeout).await {
                Ok(0) => {},
                Ok(removed) => debug!(removed, "Purged expired locks"),
                Err(e) => warn!(error = %e, "Failed to purge expired locks"),
            }
        }
        Ok(())
    }
}
