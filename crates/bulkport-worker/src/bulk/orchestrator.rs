use async_trait::async_trait;
use bulkport_common::ResourcePath;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::jobs::{BulkJob, EventType, JobContext, JobHandle, ScheduleOptions};
use super::processor::{
    Capabilities, CompletionDirective, Delegated, Ownership, RowOutcome, RowProcessor,
};
use super::sheet::SheetReader;
use super::state::{RequestLedger, TransitionOutcome};
use super::store::{BulkRequestStore, SourceFileStore};
use super::types::{
    BulkRequest, BulkStatus, FileStatus, RowCounters, RowLog, TransitionPatch,
    ORIGINAL_FILE_STATUS,
};
use super::{BulkError, Result};
use crate::cancel::{CancelSignal, CancellationProbe, Checkpoint};
use crate::config::BulkConfig;
use crate::lock::LockManager;
use crate::storage::{ObjectReader, ObjectStore, StorageError};

/// How a dispatched unit ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// The request was marked FAILED with this message
    Failed(String),
    Cancelled,
    /// Completion was handed to a follow-up unit
    Deferred,
    /// Nothing to do; the request was already in this state
    Skipped(BulkStatus),
}

/// Cancellation requested through the dispatcher or the persisted status
struct RequestCancelProbe {
    handle: Arc<dyn JobHandle>,
    requests: Arc<dyn BulkRequestStore>,
    request_id: Uuid,
}

#[async_trait]
impl CancellationProbe for RequestCancelProbe {
    async fn is_cancel_requested(&self) -> bool {
        match self.handle.is_cancel_requested().await {
            Ok(true) => return true,
            Ok(false) => {},
            Err(e) => warn!(request_id = %self.request_id, error = %e, "Cancellation check failed"),
        }

        match self.requests.load(self.request_id).await {
            Ok(request) => request.status == BulkStatus::Cancelling,
            Err(e) => {
                warn!(request_id = %self.request_id, error = %e, "Could not load request status");
                false
            },
        }
    }
}

/// Drives bulk requests through the state machine
pub struct BulkRequestService {
    pub(super) ledger: RequestLedger,
    pub(super) requests: Arc<dyn BulkRequestStore>,
    pub(super) files: Arc<dyn SourceFileStore>,
    pub(super) storage: Arc<dyn ObjectStore>,
    pub(super) locks: LockManager,
    pub(super) config: BulkConfig,
    processors: HashMap<&'static str, Arc<dyn RowProcessor>>,
}

impl BulkRequestService {
    pub fn new(
        requests: Arc<dyn BulkRequestStore>,
        files: Arc<dyn SourceFileStore>,
        storage: Arc<dyn ObjectStore>,
        locks: LockManager,
        config: BulkConfig,
    ) -> Self {
        Self {
            ledger: RequestLedger::new(requests.clone()),
            requests,
            files,
            storage,
            locks,
            config,
            processors: HashMap::new(),
        }
    }

    /// Make `processor` available under its name
    pub fn register(mut self, processor: Arc<dyn RowProcessor>) -> Self {
        info!(processor = processor.name(), "Registered row processor");
        self.processors.insert(processor.name(), processor);
        self
    }

    pub fn ledger(&self) -> &RequestLedger {
        &self.ledger
    }

    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    pub(super) fn processor(&self, name: &str) -> Result<Arc<dyn RowProcessor>> {
        self.processors
            .get(name)
            .cloned()
            .ok_or_else(|| BulkError::Configuration(format!("no row processor named '{}'", name)))
    }

    pub(super) fn cancel_signal(&self, job: &BulkJob, handle: &Arc<dyn JobHandle>) -> CancelSignal {
        let probe = RequestCancelProbe {
            handle: handle.clone(),
            requests: self.requests.clone(),
            request_id: job.request_id,
        };
        CancelSignal::with_probe(Arc::new(probe), self.config.cancel_poll_interval())
    }

    /// Run one work unit
    pub async fn dispatch(&self, job: &BulkJob, handle: Arc<dyn JobHandle>) -> Result<JobOutcome> {
        match job.event_type {
            EventType::ProcessFile => self.process_file(job, handle).await,
            EventType::MediaTransfer => self.process_media_phase(job, handle).await,
            EventType::Cleanup => self.cleanup_temp_files(job).await,
        }
    }

    /// Stream the source file through the job's processor
    ///
    /// Errors returned from here leave the request untouched and are meant
    /// for the dispatcher to retry (lock contention, unknown processor, a
    /// missing request). Failures after processing began are reconciled and
    /// reported as [`JobOutcome::Failed`].
    #[instrument(skip(self, job, handle), fields(request_id = %job.request_id, processor = %job.processor))]
    pub async fn process_file(&self, job: &BulkJob, handle: Arc<dyn JobHandle>) -> Result<JobOutcome> {
        let processor = self.processor(&job.processor)?;
        let request = self.ledger.load(job.request_id).await?;

        if request.status.is_terminal() {
            info!(status = %request.status, "Request already finished, skipping");
            return Ok(JobOutcome::Skipped(request.status));
        }

        let cancel = self.cancel_signal(job, &handle);
        let ctx = JobContext::new(job, handle.as_ref(), &cancel);

        if request.status == BulkStatus::Cancelling {
            self.reconcile_cancellation(&ctx, Some(processor.as_ref())).await?;
            return Ok(JobOutcome::Cancelled);
        }

        let source = source_path(job)?;
        let held = self
            .locks
            .acquire(&self.config.file_lock_namespace, &source, &self.locks.default_options())
            .await?;

        let result = self.run_parse(&ctx, processor.as_ref(), &request).await;
        let outcome = self.settle(&ctx, processor.as_ref(), result).await;

        held.release().await;
        outcome
    }

    /// Map a phase result to an outcome, reconciling failures and cancellations
    pub(super) async fn settle(
        &self,
        ctx: &JobContext<'_>,
        processor: &dyn RowProcessor,
        result: Result<JobOutcome>,
    ) -> Result<JobOutcome> {
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_cancellation() => {
                info!(request_id = %ctx.request_id(), reason = %e, "Request cancelled");
                self.reconcile_cancellation(ctx, Some(processor)).await?;
                Ok(JobOutcome::Cancelled)
            },
            Err(e) => {
                let message = e.to_string();
                error!(request_id = %ctx.request_id(), error = %message, "Request processing failed");
                self.reconcile_failure(ctx, Some(processor), &message).await?;
                Ok(JobOutcome::Failed(message))
            },
        }
    }

    async fn run_parse(
        &self,
        ctx: &JobContext<'_>,
        processor: &dyn RowProcessor,
        request: &BulkRequest,
    ) -> Result<JobOutcome> {
        let job = ctx.job;
        let file = self.files.get(job.file_id).await?;

        if request.original_file_status().is_none() {
            let mut entries = Map::new();
            entries.insert(
                ORIGINAL_FILE_STATUS.to_string(),
                Value::String(file.status.as_str().to_string()),
            );
            self.requests.merge_metadata(job.request_id, entries).await?;
        }

        let total_rows = job.options.total_rows.or(request.total_rows);
        if request.status == BulkStatus::Pending {
            let patch = TransitionPatch {
                total_rows,
                ..TransitionPatch::default()
            };
            match self
                .ledger
                .transition(job.request_id, BulkStatus::Pending, BulkStatus::Processing, &patch)
                .await?
            {
                TransitionOutcome::Applied => {},
                TransitionOutcome::Ignored(status) => return Ok(JobOutcome::Skipped(status)),
                TransitionOutcome::Conflict(BulkStatus::Processing) => {},
                TransitionOutcome::Conflict(status) => {
                    return Err(BulkError::InvalidTransition {
                        from: status,
                        to: BulkStatus::Processing,
                    })
                },
            }
        }
        self.files.set_status(job.file_id, FileStatus::Processing).await?;

        processor.on_start(ctx).await?;

        let reader = self.storage.open_read(&file.storage_key).await?;
        let mut sheet = SheetReader::open(reader, &file.name, processor.create_row()).await?;
        let capabilities = processor.capabilities(job);
        let request_id = job.request_id;
        info!(
            file = %file.name,
            capabilities = ?capabilities.descriptor(),
            "Processing started"
        );

        let mut counters = RowCounters::default();
        let mut pending_logs: Vec<RowLog> = Vec::new();

        let read = self
            .read_rows(
                ctx,
                processor,
                &capabilities,
                &mut sheet,
                &mut counters,
                &mut pending_logs,
                total_rows,
            )
            .await;

        // Rows already handed to the processor keep their logs and counts
        // whatever ended the loop
        if let Err(e) = read {
            if let Err(save) = self.save_rows(request_id, &counters, &mut pending_logs).await {
                warn!(error = %save, "Failed to persist buffered rows");
            }
            return Err(e);
        }

        self.flush(ctx, processor, &capabilities, &counters, &mut pending_logs, total_rows)
            .await?;
        info!(
            processed = counters.processed,
            successful = counters.successful,
            failed = counters.failed,
            "Sheet fully read"
        );

        processor.on_complete(ctx, &counters).await?;

        if let Delegated::Processor(hook) = capabilities.completion {
            if hook.on_processing_complete(ctx, &counters).await? == CompletionDirective::Deferred {
                info!("Completion deferred to a follow-up unit");
                return Ok(JobOutcome::Deferred);
            }
        }

        self.finalize(ctx, processor, &capabilities).await
    }

    /// Feed every row to the processor, flushing every `flush_every` rows
    #[allow(clippy::too_many_arguments)]
    async fn read_rows(
        &self,
        ctx: &JobContext<'_>,
        processor: &dyn RowProcessor,
        capabilities: &Capabilities<'_>,
        sheet: &mut SheetReader<ObjectReader>,
        counters: &mut RowCounters,
        pending_logs: &mut Vec<RowLog>,
        total_rows: Option<u64>,
    ) -> Result<()> {
        let stop_on_first_error = ctx.job.options.stop_on_first_error;
        let flush_every = self.config.flush_every.max(1);

        loop {
            ctx.cancel.checkpoint(Checkpoint::BeforeRow).await?;
            let Some(row) = sheet.next_row().await? else {
                return Ok(());
            };

            let outcome = match processor.process_row(row.cells, row.number, ctx).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    warn!(row_number = row.number, error = %e, "Row processing raised an error");
                    RowOutcome::failure(processor.entity_type(), vec![e.to_string()])
                },
            };

            let success = outcome.is_success();
            counters.record(success);
            let first_error = outcome.errors.first().cloned();
            pending_logs.push(row_log(row.number, outcome));

            if !success && stop_on_first_error {
                return Err(BulkError::Processor(format!(
                    "row {} failed: {}",
                    row.number,
                    first_error.unwrap_or_default()
                )));
            }

            if counters.processed % flush_every == 0 {
                self.flush(ctx, processor, capabilities, counters, pending_logs, total_rows)
                    .await?;
            }
        }
    }

    /// Persist buffered logs and counters
    async fn save_rows(
        &self,
        request_id: Uuid,
        counters: &RowCounters,
        pending_logs: &mut Vec<RowLog>,
    ) -> Result<()> {
        if !pending_logs.is_empty() {
            let kept = self
                .requests
                .append_row_logs(request_id, pending_logs, self.config.max_row_logs)
                .await?;
            if kept < pending_logs.len() {
                debug!(dropped = pending_logs.len() - kept, "Row log limit reached");
            }
            pending_logs.clear();
        }
        self.requests.save_progress(request_id, counters).await
    }

    /// Persist counters and buffered logs, then report progress
    async fn flush(
        &self,
        ctx: &JobContext<'_>,
        processor: &dyn RowProcessor,
        capabilities: &Capabilities<'_>,
        counters: &RowCounters,
        pending_logs: &mut Vec<RowLog>,
        total_rows: Option<u64>,
    ) -> Result<()> {
        let request_id = ctx.request_id();
        self.save_rows(request_id, counters, pending_logs).await?;

        if let Err(e) = processor.on_batch_update(ctx, counters).await {
            warn!(request_id = %request_id, error = %e, "Batch update hook failed");
        }

        if capabilities.progress == Ownership::Orchestrator {
            if let Some(total) = total_rows.filter(|t| *t > 0) {
                let percent = (counters.processed.saturating_mul(100) / total).min(99) as u8;
                self.report_progress(ctx, percent).await;
            }
        }
        Ok(())
    }

    /// Best-effort progress to the dispatcher and the request record
    pub(super) async fn report_progress(&self, ctx: &JobContext<'_>, percent: u8) {
        let request_id = ctx.request_id();
        if let Err(e) = ctx.handle.update_progress(percent).await {
            warn!(request_id = %request_id, percent, error = %e, "Failed to report progress");
        }
        if let Err(e) = self.requests.set_progress(request_id, percent).await {
            warn!(request_id = %request_id, percent, error = %e, "Failed to store progress");
        }
    }

    /// Default completion: COMPLETED, restore file status, 100%, schedule cleanup
    pub(super) async fn finalize(
        &self,
        ctx: &JobContext<'_>,
        processor: &dyn RowProcessor,
        capabilities: &Capabilities<'_>,
    ) -> Result<JobOutcome> {
        let job = ctx.job;
        let outcome = self
            .ledger
            .transition(
                job.request_id,
                BulkStatus::Processing,
                BulkStatus::Completed,
                &TransitionPatch::progress(100),
            )
            .await?;

        match outcome {
            TransitionOutcome::Applied => {},
            TransitionOutcome::Ignored(status) => return Ok(JobOutcome::Skipped(status)),
            TransitionOutcome::Conflict(BulkStatus::Cancelling) => {
                self.reconcile_cancellation(ctx, Some(processor)).await?;
                return Ok(JobOutcome::Cancelled);
            },
            TransitionOutcome::Conflict(status) => {
                return Err(BulkError::InvalidTransition {
                    from: status,
                    to: BulkStatus::Completed,
                })
            },
        }

        if capabilities.file_status == Ownership::Orchestrator {
            self.restore_file_status(job).await;
        }
        if let Err(e) = ctx.handle.update_progress(100).await {
            warn!(error = %e, "Failed to report final progress");
        }
        self.schedule_cleanup(ctx).await;

        info!(request_id = %job.request_id, "Request completed");
        Ok(JobOutcome::Completed)
    }

    async fn schedule_cleanup(&self, ctx: &JobContext<'_>) {
        let cleanup = ctx.job.follow_up(EventType::Cleanup);
        if let Err(e) = ctx
            .handle
            .schedule(cleanup, ScheduleOptions::cleanup(&self.config))
            .await
        {
            warn!(request_id = %ctx.request_id(), error = %e, "Failed to schedule cleanup");
        }
    }

    /// Put the source file back in the status recorded before the job; best-effort
    async fn restore_file_status(&self, job: &BulkJob) {
        let original = match self.requests.load(job.request_id).await {
            Ok(request) => request.original_file_status(),
            Err(e) => {
                warn!(request_id = %job.request_id, error = %e, "Could not load request to restore file status");
                return;
            },
        };

        let Some(status) = original else {
            return;
        };
        match self.files.set_status(job.file_id, status).await {
            Ok(()) => debug!(file_id = %job.file_id, status = %status, "File status restored"),
            Err(e) => warn!(file_id = %job.file_id, error = %e, "Failed to restore file status"),
        }
    }

    /// Record a failure against the freshest persisted state
    ///
    /// Terminal requests are left alone and a request being cancelled is
    /// handed to the cancellation path.
    pub(super) async fn reconcile_failure(
        &self,
        ctx: &JobContext<'_>,
        processor: Option<&dyn RowProcessor>,
        message: &str,
    ) -> Result<()> {
        let request_id = ctx.request_id();
        let current = self.ledger.load(request_id).await?;

        if current.status.is_terminal() {
            info!(request_id = %request_id, status = %current.status, "Request already terminal, not marking failed");
            return Ok(());
        }
        if current.status == BulkStatus::Cancelling {
            return self.reconcile_cancellation(ctx, processor).await;
        }

        let capabilities = processor
            .map(|p| p.capabilities(ctx.job))
            .unwrap_or_default();

        if let Delegated::Processor(hook) = capabilities.error_states {
            if let Err(e) = hook.on_processing_failed(ctx, message).await {
                warn!(request_id = %request_id, error = %e, "Failure hook failed");
            }
        }

        match self
            .ledger
            .walk_to(request_id, BulkStatus::Failed, &TransitionPatch::failed(message))
            .await?
        {
            TransitionOutcome::Applied => {
                info!(request_id = %request_id, "Request marked failed");
            },
            TransitionOutcome::Ignored(_) => return Ok(()),
            TransitionOutcome::Conflict(BulkStatus::Cancelling) => {
                return self.reconcile_cancellation(ctx, processor).await;
            },
            TransitionOutcome::Conflict(status) => {
                warn!(request_id = %request_id, status = %status, "Could not mark request failed");
                return Ok(());
            },
        }

        if capabilities.file_status == Ownership::Orchestrator {
            self.restore_file_status(ctx.job).await;
        }
        Ok(())
    }

    /// Walk the request to CANCELLED, running the processor's cleanup first
    pub(super) async fn reconcile_cancellation(
        &self,
        ctx: &JobContext<'_>,
        processor: Option<&dyn RowProcessor>,
    ) -> Result<()> {
        let request_id = ctx.request_id();

        match self
            .ledger
            .walk_to(request_id, BulkStatus::Cancelling, &TransitionPatch::default())
            .await?
        {
            TransitionOutcome::Applied => {},
            TransitionOutcome::Ignored(status) => {
                info!(request_id = %request_id, status = %status, "Request already terminal, not cancelling");
                return Ok(());
            },
            TransitionOutcome::Conflict(status) => {
                warn!(request_id = %request_id, status = %status, "Could not move request to cancelling");
                return Ok(());
            },
        }

        let capabilities = processor
            .map(|p| p.capabilities(ctx.job))
            .unwrap_or_default();

        if let Delegated::Processor(hook) = capabilities.error_states {
            if let Err(e) = hook.on_processing_cancelled(ctx).await {
                warn!(request_id = %request_id, error = %e, "Cancellation hook failed");
            }
        }

        if self
            .ledger
            .transition(request_id, BulkStatus::Cancelling, BulkStatus::Cancelled, &TransitionPatch::default())
            .await?
            .is_applied()
        {
            info!(request_id = %request_id, "Request cancelled");
        }

        if capabilities.file_status == Ownership::Orchestrator {
            self.restore_file_status(ctx.job).await;
        }
        Ok(())
    }

    /// Delete the source file of a finished request; idempotent
    #[instrument(skip(self, job), fields(request_id = %job.request_id, file_id = %job.file_id))]
    pub async fn cleanup_temp_files(&self, job: &BulkJob) -> Result<JobOutcome> {
        let file = match self.files.get(job.file_id).await {
            Ok(file) => file,
            Err(BulkError::NotFound(_)) => {
                info!("Source file record gone, nothing to clean up");
                return Ok(JobOutcome::Completed);
            },
            Err(e) => return Err(e),
        };

        if file.status == FileStatus::Deleted {
            return Ok(JobOutcome::Completed);
        }

        if self.storage.exists(&file.storage_key).await? {
            match self.storage.delete(&file.storage_key).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {},
                Err(e) => return Err(e.into()),
            }
            info!(key = %file.storage_key, "Source file deleted");
        } else {
            info!(key = %file.storage_key, "Source object already gone");
        }
        self.files.mark_deleted(file.id).await?;

        Ok(JobOutcome::Completed)
    }

    /// Dispatcher gave up on the unit after its last attempt
    pub async fn handle_job_failure(
        &self,
        job: &BulkJob,
        handle: Arc<dyn JobHandle>,
        error: &str,
    ) -> Result<()> {
        if job.event_type == EventType::Cleanup {
            warn!(request_id = %job.request_id, error, "Cleanup unit failed permanently");
            return Ok(());
        }

        let processor = self.processor(&job.processor).ok();
        let cancel = CancelSignal::new();
        let ctx = JobContext::new(job, handle.as_ref(), &cancel);
        self.reconcile_failure(&ctx, processor.as_deref(), error).await
    }

    /// Dispatcher cancelled the unit before or while it ran
    pub async fn handle_job_cancellation(&self, job: &BulkJob, handle: Arc<dyn JobHandle>) -> Result<()> {
        if job.event_type == EventType::Cleanup {
            return Ok(());
        }

        let processor = self.processor(&job.processor).ok();
        let cancel = CancelSignal::new();
        cancel.cancel();
        let ctx = JobContext::new(job, handle.as_ref(), &cancel);
        self.reconcile_cancellation(&ctx, processor.as_deref()).await
    }

    /// Dispatcher saw no progress from the unit for too long
    pub async fn handle_job_stalled(&self, job: &BulkJob, handle: Arc<dyn JobHandle>) -> Result<()> {
        let message = format!(
            "{} unit stalled without progress at {}",
            job.event_type,
            Utc::now().to_rfc3339()
        );
        self.handle_job_failure(job, handle, &message).await
    }
}

/// Lock path guarding a source file
pub(super) fn source_path(job: &BulkJob) -> Result<ResourcePath> {
    ResourcePath::from_segments([
        "companies".to_string(),
        job.company_id.to_string(),
        "files".to_string(),
        job.file_id.to_string(),
    ])
    .map_err(|e| BulkError::Configuration(e.to_string()))
}

pub(super) fn row_log(row_number: u64, outcome: RowOutcome) -> RowLog {
    RowLog {
        row_number,
        entity_id: outcome.entity_id,
        entity_type: outcome.entity_type,
        errors: outcome.errors,
        warnings: outcome.warnings,
        metadata: outcome.metadata,
        processed_at: Utc::now(),
    }
}
