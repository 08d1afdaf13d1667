//! Media catalog import
//!
//! Each row becomes a catalog item. Media URLs are re-hosted under the
//! item's folder `/companies/{company}/catalog/{sku}` while that folder is
//! locked. An item only becomes visible once all of its media is stored.
//!
//! Single-phase requests transfer media while reading the row. Two-phase
//! requests persist every item first and transfer media from a
//! `media-transfer` unit, which pages through the pending items. Items whose
//! folder was locked elsewhere stay pending in either mode and are picked up
//! by such a unit too.

use async_trait::async_trait;
use bulkport_common::ResourcePath;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::models::{CatalogItem, CatalogMedia, CatalogRow, MediaStatus, NewCatalogItem};
use super::repository::CatalogRepository;
use crate::bulk::{
    BulkError, BulkJob, Capabilities, CompletionDirective, CompletionHook, Delegated,
    EntityOutcome, ErrorStateHook, EventType, JobContext, MediaPhaseHook, Ownership, PhaseItem, QuotaLedger, Result, Row,
    RowCounters, RowOutcome, RowProcessor, ScheduleOptions, UserQuota,
};
use crate::config::Config;
use crate::lock::LockManager;
use crate::storage::StorageError;
use crate::transfer::{BatchOptions, QuotaBudget, TransferPipeline};

pub const PROCESSOR_NAME: &str = "media-catalog";
pub const ENTITY_TYPE: &str = "catalog_item";

/// Progress reached when phase one of a two-phase request ends
const PHASE_ONE_SPAN: u64 = 50;

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub media_lock_namespace: String,
    /// Items deleted per page when a request is rolled back
    pub delete_page_size: usize,
    pub transfer_concurrency: usize,
    /// Attempts for the scheduled media-transfer unit
    pub follow_up_attempts: u32,
    pub follow_up_retention: Duration,
}

impl CatalogSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            media_lock_namespace: config.bulk.media_lock_namespace.clone(),
            delete_page_size: config.bulk.delete_page_size.max(1),
            transfer_concurrency: config.transfer.concurrency,
            follow_up_attempts: config.worker.max_attempts,
            follow_up_retention: Duration::from_secs(config.bulk.cleanup_retention_secs),
        }
    }
}

/// Lock and storage folder of one item
pub fn media_folder(company_id: Uuid, sku: &str) -> Result<ResourcePath> {
    ResourcePath::from_segments([
        "companies".to_string(),
        company_id.to_string(),
        "catalog".to_string(),
        sku.to_string(),
    ])
    .map_err(|e| BulkError::Processor(e.to_string()))
}

pub struct MediaCatalogProcessor {
    catalog: Arc<dyn CatalogRepository>,
    quotas: Arc<dyn QuotaLedger>,
    transfers: Arc<TransferPipeline>,
    locks: LockManager,
    settings: CatalogSettings,
}

impl MediaCatalogProcessor {
    pub fn new(
        catalog: Arc<dyn CatalogRepository>,
        quotas: Arc<dyn QuotaLedger>,
        transfers: Arc<TransferPipeline>,
        locks: LockManager,
        settings: CatalogSettings,
    ) -> Self {
        Self {
            catalog,
            quotas,
            transfers,
            locks,
            settings,
        }
    }

    /// Transfer an item's media under its folder lock
    ///
    /// Media failures end up as warnings and a folder locked elsewhere as
    /// [`EntityOutcome::Busy`]. Only cancellation and persistence errors are
    /// returned.
    async fn transfer_media(&self, ctx: &JobContext<'_>, item: &CatalogItem) -> Result<EntityOutcome> {
        let folder = media_folder(item.company_id, &item.sku)?;
        let options = self.locks.default_options();

        let result = self
            .locks
            .with_locks(
                &self.settings.media_lock_namespace,
                vec![folder.clone()],
                &options,
                || self.transfer_locked(ctx, item, folder),
            )
            .await;

        match result {
            Ok(outcome) => Ok(EntityOutcome::Processed(outcome)),
            Err(BulkError::Lock(e)) if e.is_busy() => {
                info!(sku = %item.sku, error = %e, "Media folder busy, media left pending");
                Ok(EntityOutcome::Busy(e.to_string()))
            },
            Err(e) => Err(e),
        }
    }

    async fn transfer_locked(
        &self,
        ctx: &JobContext<'_>,
        item: &CatalogItem,
        folder: ResourcePath,
    ) -> Result<RowOutcome> {
        let budget = QuotaBudget::shared(Arc::new(UserQuota::new(
            self.quotas.clone(),
            ctx.job.user_id,
        )));

        if let Err(e) = self.transfers.store().create_folder(&folder.to_key()).await {
            warn!(folder = %folder, error = %e, "Failed to create media folder marker");
        }

        let batch = self
            .transfers
            .download_batch(
                &item.media_urls,
                &BatchOptions::new(folder, budget),
                self.settings.transfer_concurrency,
                ctx.cancel,
            )
            .await?;

        let media: Vec<CatalogMedia> = batch
            .results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.success)
            .filter_map(|(position, r)| {
                Some(CatalogMedia {
                    id: Uuid::new_v4(),
                    item_id: item.id,
                    storage_key: r.storage_path.clone()?,
                    original_url: r.original_url.clone(),
                    mime_type: r.mime_type.clone(),
                    size: r.size,
                    checksum: r.checksum.clone(),
                    position: u32::try_from(position).unwrap_or(u32::MAX),
                })
            })
            .collect();
        self.catalog.attach_media(item.id, &media).await?;

        let complete = batch.all_succeeded();
        let status = if complete {
            MediaStatus::Done
        } else {
            MediaStatus::Partial
        };
        self.catalog.set_media_result(item.id, status, complete).await?;

        let mut outcome = RowOutcome::success(ENTITY_TYPE, item.id.to_string())
            .with_metadata("media_stored", batch.succeeded)
            .with_metadata("media_bytes", batch.total_bytes);
        for failed in batch.results.iter().filter(|r| !r.success) {
            let reason = failed
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "unknown error".to_string());
            outcome = outcome.with_warning(format!("media {}: {}", failed.original_url, reason));
        }

        debug!(
            sku = %item.sku,
            stored = batch.succeeded,
            failed = batch.failed,
            "Item media transferred"
        );
        Ok(outcome)
    }

    /// Delete every item of the request with its stored media
    #[instrument(skip(self, job), fields(request_id = %job.request_id))]
    async fn purge(&self, job: &BulkJob) -> Result<u64> {
        let mut removed = 0;
        let mut released_bytes = 0;

        loop {
            let page = self
                .catalog
                .items_for_request(job.request_id, self.settings.delete_page_size)
                .await?;
            if page.is_empty() {
                break;
            }

            let ids: Vec<Uuid> = page.iter().map(|i| i.id).collect();
            // Items whose transfer ran have a folder marker
            for item in page
                .iter()
                .filter(|i| matches!(i.media_status, MediaStatus::Done | MediaStatus::Partial))
            {
                let marker = format!("{}/", media_folder(item.company_id, &item.sku)?.to_key());
                match self.transfers.store().delete(&marker).await {
                    Ok(()) | Err(StorageError::NotFound(_)) => {},
                    Err(e) => warn!(key = %marker, error = %e, "Failed to delete media folder marker"),
                }
            }
            for media in self.catalog.media_for_items(&ids).await? {
                match self.transfers.store().delete(&media.storage_key).await {
                    Ok(()) | Err(StorageError::NotFound(_)) => released_bytes += media.size,
                    Err(e) => {
                        warn!(key = %media.storage_key, error = %e, "Failed to delete media object")
                    },
                }
            }

            let deleted = self.catalog.delete_items(&ids).await?;
            if deleted == 0 {
                return Err(BulkError::Persistence(
                    "catalog items could not be deleted".to_string(),
                ));
            }
            removed += deleted;
        }

        if released_bytes > 0 {
            self.quotas.release(job.user_id, released_bytes).await?;
        }
        if removed > 0 {
            info!(removed, released_bytes, "Catalog items purged");
        }
        Ok(removed)
    }
}

#[async_trait]
impl RowProcessor for MediaCatalogProcessor {
    fn name(&self) -> &'static str {
        PROCESSOR_NAME
    }

    fn entity_type(&self) -> &'static str {
        ENTITY_TYPE
    }

    fn create_row(&self) -> Row {
        CatalogRow::COLUMNS
            .iter()
            .map(|c| (c.to_string(), String::new()))
            .collect()
    }

    async fn process_row(&self, row: Row, row_number: u64, ctx: &JobContext<'_>) -> Result<RowOutcome> {
        let parsed = match CatalogRow::parse(&row) {
            Ok(parsed) => parsed,
            Err(errors) => return Ok(RowOutcome::failure(ENTITY_TYPE, errors)),
        };

        let job = ctx.job;
        if self.catalog.sku_exists(job.company_id, &parsed.sku).await? {
            return Ok(RowOutcome::failure(
                ENTITY_TYPE,
                vec![format!("sku '{}' already exists", parsed.sku)],
            ));
        }

        let item = self
            .catalog
            .insert_item(&NewCatalogItem {
                company_id: job.company_id,
                request_id: job.request_id,
                row_number,
                sku: parsed.sku,
                title: parsed.title,
                description: parsed.description,
                price_cents: parsed.price_cents,
                media_urls: parsed.media_urls,
            })
            .await?;

        if item.media_urls.is_empty() {
            return Ok(RowOutcome::success(ENTITY_TYPE, item.id.to_string()));
        }
        if job.options.two_phase {
            return Ok(RowOutcome::success(ENTITY_TYPE, item.id.to_string())
                .with_metadata("media_deferred", item.media_urls.len()));
        }

        match self.transfer_media(ctx, &item).await? {
            EntityOutcome::Processed(outcome) => Ok(outcome),
            EntityOutcome::Busy(reason) => Ok(RowOutcome::success(ENTITY_TYPE, item.id.to_string())
                .with_metadata("media_deferred", reason)),
        }
    }

    /// Items left behind by an earlier attempt of the same request
    async fn on_start(&self, ctx: &JobContext<'_>) -> Result<()> {
        self.purge(ctx.job).await?;
        Ok(())
    }

    async fn on_batch_update(&self, ctx: &JobContext<'_>, counters: &RowCounters) -> Result<()> {
        if !ctx.job.options.two_phase {
            return Ok(());
        }
        if let Some(total) = ctx.job.options.total_rows.filter(|t| *t > 0) {
            let percent = (counters.processed.saturating_mul(PHASE_ONE_SPAN) / total).min(PHASE_ONE_SPAN);
            if let Err(e) = ctx.handle.update_progress(percent as u8).await {
                warn!(request_id = %ctx.request_id(), error = %e, "Failed to report progress");
            }
        }
        Ok(())
    }

    fn capabilities(&self, job: &BulkJob) -> Capabilities<'_> {
        Capabilities {
            completion: Delegated::Processor(self),
            error_states: Delegated::Processor(self),
            progress: if job.options.two_phase {
                Ownership::Processor
            } else {
                Ownership::Orchestrator
            },
            file_status: Ownership::Orchestrator,
        }
    }

    fn media_phase(&self) -> Option<&dyn MediaPhaseHook> {
        Some(self)
    }
}

#[async_trait]
impl CompletionHook for MediaCatalogProcessor {
    async fn on_processing_complete(
        &self,
        ctx: &JobContext<'_>,
        counters: &RowCounters,
    ) -> Result<CompletionDirective> {
        let job = ctx.job;
        if job.event_type != EventType::ProcessFile {
            return Ok(CompletionDirective::Finalize);
        }

        // Deferred media in two-phase mode, busy folders in either mode
        let pending = self.catalog.count_pending_media(job.request_id).await?;
        if pending == 0 {
            return Ok(CompletionDirective::Finalize);
        }

        if job.options.two_phase {
            if let Err(e) = ctx.handle.update_progress(PHASE_ONE_SPAN as u8).await {
                warn!(request_id = %job.request_id, error = %e, "Failed to report progress");
            }
        }
        ctx.handle
            .schedule(
                job.media_follow_up(1),
                ScheduleOptions::immediate(
                    self.settings.follow_up_attempts,
                    self.settings.follow_up_retention,
                ),
            )
            .await?;

        info!(
            request_id = %job.request_id,
            rows = counters.processed,
            pending,
            "Media transfer scheduled"
        );
        Ok(CompletionDirective::Deferred)
    }
}

#[async_trait]
impl ErrorStateHook for MediaCatalogProcessor {
    async fn on_processing_failed(&self, ctx: &JobContext<'_>, error: &str) -> Result<()> {
        warn!(request_id = %ctx.request_id(), error, "Rolling back catalog items of failed request");
        self.purge(ctx.job).await?;
        Ok(())
    }

    async fn on_processing_cancelled(&self, ctx: &JobContext<'_>) -> Result<()> {
        self.purge(ctx.job).await?;
        Ok(())
    }
}

#[async_trait]
impl MediaPhaseHook for MediaCatalogProcessor {
    async fn pending_count(&self, ctx: &JobContext<'_>) -> Result<u64> {
        self.catalog.count_pending_media(ctx.request_id()).await
    }

    async fn next_page(
        &self,
        ctx: &JobContext<'_>,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<PhaseItem>> {
        let items = self
            .catalog
            .pending_media_page(ctx.request_id(), after, limit)
            .await?;

        Ok(items
            .into_iter()
            .map(|item| PhaseItem {
                entity_id: item.id.to_string(),
                position: item.row_number,
            })
            .collect())
    }

    async fn process_entity(&self, ctx: &JobContext<'_>, item: &PhaseItem) -> Result<EntityOutcome> {
        let id = Uuid::parse_str(&item.entity_id)
            .map_err(|e| BulkError::Processor(format!("bad entity id {}: {}", item.entity_id, e)))?;

        match self.catalog.get_item(id).await? {
            Some(stored) if stored.media_status == MediaStatus::Pending => {
                self.transfer_media(ctx, &stored).await
            },
            Some(stored) => Ok(EntityOutcome::Processed(RowOutcome::success(
                ENTITY_TYPE,
                stored.id.to_string(),
            ))),
            None => Ok(EntityOutcome::Processed(RowOutcome::failure(
                ENTITY_TYPE,
                vec![format!("catalog item {} no longer exists", id)],
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_folder_layout() {
        let company = Uuid::nil();
        let folder = media_folder(company, "TEE-01").unwrap();
        assert_eq!(
            folder.as_str(),
            format!("/companies/{}/catalog/TEE-01", company)
        );
    }

    #[test]
    fn test_settings_follow_config() {
        let config = Config::default();
        let settings = CatalogSettings::from_config(&config);
        assert_eq!(settings.media_lock_namespace, "media-folders");
        assert_eq!(settings.delete_page_size, config.bulk.delete_page_size);
        assert_eq!(settings.follow_up_attempts, config.worker.max_attempts);
    }
}
