//! Media phase of bulk requests
//!
//! Two-phase requests persist entities with their media deferred and hand
//! completion to a `media-transfer` unit. That unit pages through the
//! pending entities with a fixed page size, so the entity set is never
//! loaded at once, transfers media per entity, and finalizes the request.
//! Progress runs from 50 to 99 during this phase.
//!
//! Entities whose folder is locked elsewhere stay pending. While passes
//! remain, another `media-transfer` unit is scheduled after
//! `BULK_MEDIA_RETRY_DELAY_SECS` to retry them; the last pass records them
//! as row warnings and finalizes.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::jobs::{BulkJob, EventType, JobContext, JobHandle, ScheduleOptions};
use super::orchestrator::{row_log, BulkRequestService, JobOutcome};
use super::processor::{RowOutcome, RowProcessor};
use super::types::BulkStatus;
use super::{BulkError, Result};
use crate::cancel::Checkpoint;
use crate::config::BulkConfig;

/// Progress reported when the media phase starts
const PHASE_START: u8 = 50;
/// Highest progress reported before finalization
const PHASE_END: u8 = 99;

/// Job metadata key holding the 1-based media pass
pub const MEDIA_PASS: &str = "media_pass";

/// An entity waiting for its media
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseItem {
    pub entity_id: String,
    /// Source row number; pages are ordered and resumed by it
    pub position: u64,
}

/// What a media pass did with one entity
#[derive(Debug, Clone, PartialEq)]
pub enum EntityOutcome {
    Processed(RowOutcome),
    /// A resource of the entity is locked elsewhere; the entity stays pending
    Busy(String),
}

/// Paged access to the entities of a request whose media is pending
#[async_trait]
pub trait MediaPhaseHook: Send + Sync {
    /// Entities of the request still waiting for media
    async fn pending_count(&self, ctx: &JobContext<'_>) -> Result<u64>;

    /// Up to `limit` pending entities positioned after `after`
    async fn next_page(
        &self,
        ctx: &JobContext<'_>,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<PhaseItem>>;

    /// Transfer the media of one entity; media failures belong in the outcome
    async fn process_entity(&self, ctx: &JobContext<'_>, item: &PhaseItem) -> Result<EntityOutcome>;
}

/// Media pass a unit belongs to
pub fn media_pass(job: &BulkJob) -> u32 {
    job.metadata
        .get(MEDIA_PASS)
        .and_then(Value::as_u64)
        .and_then(|pass| u32::try_from(pass).ok())
        .unwrap_or(1)
        .max(1)
}

impl BulkJob {
    /// `media-transfer` unit for pass `pass`
    pub fn media_follow_up(&self, pass: u32) -> Self {
        let mut job = self.follow_up(EventType::MediaTransfer);
        job.metadata.insert(MEDIA_PASS.to_string(), Value::from(pass));
        job
    }
}

impl ScheduleOptions {
    /// Another media pass over entities whose folders were busy
    pub fn media_retry(config: &BulkConfig) -> Self {
        Self {
            delay: Duration::from_secs(config.media_retry_delay_secs),
            attempts: config.cleanup_attempts,
            retention: Duration::from_secs(config.cleanup_retention_secs),
        }
    }
}

impl BulkRequestService {
    /// Run one media pass of a request
    #[instrument(skip(self, job, handle), fields(request_id = %job.request_id, processor = %job.processor))]
    pub async fn process_media_phase(
        &self,
        job: &BulkJob,
        handle: Arc<dyn JobHandle>,
    ) -> Result<JobOutcome> {
        let processor = self.processor(&job.processor)?;
        let request = self.ledger.load(job.request_id).await?;

        if request.status.is_terminal() {
            info!(status = %request.status, "Request already finished, skipping media phase");
            return Ok(JobOutcome::Skipped(request.status));
        }

        let cancel = self.cancel_signal(job, &handle);
        let ctx = JobContext::new(job, handle.as_ref(), &cancel);

        if request.status == BulkStatus::Cancelling {
            self.reconcile_cancellation(&ctx, Some(processor.as_ref())).await?;
            return Ok(JobOutcome::Cancelled);
        }

        let start = request.progress.clamp(PHASE_START, PHASE_END);
        let result = self.run_media_phase(&ctx, processor.as_ref(), start).await;
        self.settle(&ctx, processor.as_ref(), result).await
    }

    async fn run_media_phase(
        &self,
        ctx: &JobContext<'_>,
        processor: &dyn RowProcessor,
        start: u8,
    ) -> Result<JobOutcome> {
        let hook = processor.media_phase().ok_or_else(|| {
            BulkError::Configuration(format!(
                "processor '{}' has no media phase",
                processor.name()
            ))
        })?;

        let request_id = ctx.request_id();
        let pass = media_pass(ctx.job);
        let last_pass = pass >= self.config.media_passes;
        let total = hook.pending_count(ctx).await?;
        let page_size = self.config.media_page_size.max(1);
        let span = u64::from(PHASE_END - start);
        info!(pending = total, page_size, pass, "Media phase started");
        self.report_progress(ctx, start).await;

        let mut done: u64 = 0;
        let mut busy: u64 = 0;
        let mut cursor: Option<u64> = None;

        loop {
            let page = hook.next_page(ctx, cursor, page_size).await?;
            if page.is_empty() {
                break;
            }

            for item in &page {
                ctx.cancel.checkpoint(Checkpoint::BeforeEntity).await?;

                let outcome = match hook.process_entity(ctx, item).await? {
                    EntityOutcome::Processed(outcome) => Some(outcome),
                    EntityOutcome::Busy(reason) if last_pass => Some(
                        RowOutcome::success(processor.entity_type(), item.entity_id.clone())
                            .with_warning(format!("media not transferred: {}", reason)),
                    ),
                    EntityOutcome::Busy(reason) => {
                        debug!(entity_id = %item.entity_id, reason = %reason, "Entity busy, retried next pass");
                        busy += 1;
                        None
                    },
                };

                if let Some(outcome) = outcome.filter(|o| !o.errors.is_empty() || !o.warnings.is_empty()) {
                    self.requests
                        .append_row_logs(
                            request_id,
                            &[row_log(item.position, outcome)],
                            self.config.max_row_logs,
                        )
                        .await?;
                }

                done += 1;
                cursor = Some(item.position);
                let percent = u64::from(start) + (done * span / total.max(done)).min(span);
                self.report_progress(ctx, percent as u8).await;
            }
        }

        if busy > 0 {
            ctx.handle
                .schedule(
                    ctx.job.media_follow_up(pass + 1),
                    ScheduleOptions::media_retry(&self.config),
                )
                .await?;
            warn!(busy, pass, "Entities still busy, media pass rescheduled");
            return Ok(JobOutcome::Deferred);
        }

        info!(entities = done, pass, "Media phase finished");
        let capabilities = processor.capabilities(ctx.job);
        self.finalize(ctx, processor, &capabilities).await
    }
}
