use async_trait::async_trait;
use uuid::Uuid;

use super::store::PgJobQueue;
use crate::bulk::{BulkJob, JobHandle, Result, ScheduleOptions};

/// [`JobHandle`] for a unit claimed from [`PgJobQueue`]
#[derive(Debug, Clone)]
pub struct PgJobHandle {
    queue: PgJobQueue,
    job_id: Uuid,
}

impl PgJobHandle {
    pub fn new(queue: PgJobQueue, job_id: Uuid) -> Self {
        Self { queue, job_id }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }
}

#[async_trait]
impl JobHandle for PgJobHandle {
    async fn update_progress(&self, percent: u8) -> Result<()> {
        Ok(self.queue.update_progress(self.job_id, percent).await?)
    }

    async fn is_cancel_requested(&self) -> Result<bool> {
        Ok(self.queue.is_cancel_requested(self.job_id).await?)
    }

    async fn schedule(&self, job: BulkJob, options: ScheduleOptions) -> Result<()> {
        self.queue.enqueue(&job, options).await?;
        Ok(())
    }
}
