use bulkport_common::ResourcePath;
use futures::future::join_all;
use futures::Stream;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use super::chunker::{pump, PumpLimits, Pumped};
use super::quota::QuotaBudget;
use super::session::{MultipartSession, PartUploader, PresignedPartUploader};
use super::validation::{destination_key, resolve_mime, UrlPolicy, ValidatedUrl};
use super::{BatchOutcome, Result, TransferError, TransferResult};
use crate::cancel::{CancelSignal, Checkpoint};
use crate::config::{TransferConfig, MAX_TRANSFER_CONCURRENCY};
use crate::storage::{ObjectStore, StorageError};

/// Caller-supplied settings for one batch
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Folder the transferred objects are stored under
    pub prefix: ResourcePath,
    /// Remaining quota of the owning user
    pub budget: QuotaBudget,
    /// Tighter per-file limit than the configured maximum
    pub max_file_size: Option<u64>,
}

impl BatchOptions {
    pub fn new(prefix: ResourcePath, budget: QuotaBudget) -> Self {
        Self {
            prefix,
            budget,
            max_file_size: None,
        }
    }
}

/// Download → multipart upload pipeline
pub struct TransferPipeline {
    store: Arc<dyn ObjectStore>,
    uploader: Arc<dyn PartUploader>,
    client: reqwest::Client,
    policy: UrlPolicy,
    config: TransferConfig,
}

impl TransferPipeline {
    pub fn new(store: Arc<dyn ObjectStore>, config: TransferConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .user_agent(concat!("bulkport/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let uploader = Arc::new(PresignedPartUploader::new(
            client.clone(),
            config.part_timeout(),
        ));

        Ok(Self {
            store,
            uploader,
            client,
            policy: UrlPolicy::from_config(&config),
            config,
        })
    }

    /// Replace the part uploader
    pub fn with_uploader(mut self, uploader: Arc<dyn PartUploader>) -> Self {
        self.uploader = uploader;
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Transfer `urls` in groups of `concurrency`
    ///
    /// Per-URL failures are reported in the outcome. Only cancellation
    /// fails the call, after every object stored by this call is deleted.
    #[instrument(skip_all, fields(urls = urls.len(), prefix = %options.prefix))]
    pub async fn download_batch(
        &self,
        urls: &[String],
        options: &BatchOptions,
        concurrency: usize,
        cancel: &CancelSignal,
    ) -> Result<BatchOutcome> {
        let group_size = concurrency.clamp(1, MAX_TRANSFER_CONCURRENCY);
        let mut results: Vec<TransferResult> = Vec::with_capacity(urls.len());

        for (index, group) in urls.chunks(group_size).enumerate() {
            if index > 0 && !self.config.batch_pause().is_zero() {
                sleep(self.config.batch_pause()).await;
            }

            if let Err(cancelled) = cancel.checkpoint(Checkpoint::BeforeBatch).await {
                self.compensate(&results, &options.budget).await;
                return Err(cancelled.into());
            }

            let outcomes = join_all(
                group
                    .iter()
                    .map(|url| self.transfer_with_retry(url, options, cancel)),
            )
            .await;

            let mut cancellation = None;
            for outcome in outcomes {
                match outcome {
                    Ok(result) => results.push(result),
                    Err(e) => cancellation = Some(e),
                }
            }

            if let Some(e) = cancellation {
                self.compensate(&results, &options.budget).await;
                return Err(e);
            }
        }

        let outcome = BatchOutcome::from_results(results);
        info!(
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            bytes = outcome.total_bytes,
            "Transfer batch finished"
        );
        Ok(outcome)
    }

    /// Delete every object stored so far in a cancelled batch and refund its quota
    async fn compensate(&self, results: &[TransferResult], budget: &QuotaBudget) {
        let stored: Vec<(&str, u64)> = results
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.storage_path.as_deref().map(|key| (key, r.size)))
            .collect();
        if stored.is_empty() {
            return;
        }

        info!(objects = stored.len(), "Batch cancelled, deleting stored objects");
        for (key, size) in stored {
            match self.store.delete(key).await {
                Ok(()) | Err(StorageError::NotFound(_)) => budget.refund(size).await,
                Err(e) => {
                    warn!(key, error = %e, "Failed to delete object of cancelled batch")
                },
            }
        }
    }

    /// Returns `Err` only on cancellation
    async fn transfer_with_retry(
        &self,
        url: &str,
        options: &BatchOptions,
        cancel: &CancelSignal,
    ) -> Result<TransferResult> {
        let validated = match self.policy.validate(url) {
            Ok(validated) => validated,
            Err(e) => {
                warn!(url, error = %e, "Rejected media URL");
                return Ok(TransferResult::failed(url, 0, &e));
            },
        };

        let backoff = self.config.backoff();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.transfer_once(&validated, options, cancel).await {
                Ok(mut result) => {
                    result.attempts = attempt;
                    return Ok(result);
                },
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = backoff.delay(attempt);
                    warn!(
                        url,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Transfer attempt failed, retrying in {:?}",
                        delay
                    );
                    cancel.checkpoint(Checkpoint::BeforeRetry).await?;
                    sleep(delay).await;
                },
                Err(e) => {
                    warn!(url, attempt, error = %e, "Transfer failed");
                    return Ok(TransferResult::failed(url, attempt, &e));
                },
            }
        }
    }

    #[instrument(skip_all, fields(url = %target.url))]
    async fn transfer_once(
        &self,
        target: &ValidatedUrl,
        options: &BatchOptions,
        cancel: &CancelSignal,
    ) -> Result<TransferResult> {
        cancel.checkpoint(Checkpoint::BeforeRequest).await?;

        let response = timeout(
            self.config.request_timeout(),
            self.client.get(target.url.clone()).send(),
        )
        .await
        .map_err(|_| {
            TransferError::Timeout(format!(
                "no response within {:?}",
                self.config.request_timeout()
            ))
        })??;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::HttpStatus {
                status: status.as_u16(),
                url: target.url.to_string(),
            });
        }

        let max_size = options
            .max_file_size
            .map_or(self.config.max_file_size, |m| m.min(self.config.max_file_size));
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mime_type = resolve_mime(content_type.as_deref(), target.extension.as_deref());
        let key = destination_key(&options.prefix, &target.file_name);

        let mut reserved: u64 = 0;
        if let Some(declared) = response.content_length().filter(|len| *len > 0) {
            if declared > max_size {
                return Err(TransferError::SizeExceeded {
                    limit: max_size,
                    actual: declared,
                });
            }
            cancel.checkpoint(Checkpoint::BeforeQuotaCheck).await?;
            options.budget.reserve(declared).await?;
            reserved = declared;
        }

        let uploaded = self
            .upload_stream(
                response.bytes_stream(),
                &key,
                mime_type.as_deref(),
                max_size,
                &options.budget,
                &mut reserved,
                cancel,
            )
            .await;

        let (pumped, etag) = match uploaded {
            Ok(done) => done,
            Err(e) => {
                options.budget.refund(reserved).await;
                return Err(e);
            },
        };

        // A declared length larger than the body leaves quota to hand back
        if reserved > pumped.bytes {
            options.budget.refund(reserved - pumped.bytes).await;
        }

        info!(key = %key, bytes = pumped.bytes, "Media transferred");
        Ok(TransferResult {
            success: true,
            original_url: target.url.to_string(),
            storage_path: Some(key),
            size: pumped.bytes,
            mime_type,
            etag,
            checksum: Some(pumped.checksum),
            attempts: 1,
            error: None,
        })
    }

    /// Stream `body` into a new multipart upload at `key`
    ///
    /// The session is aborted exactly once if anything fails before completion.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn upload_stream<S, B, E>(
        &self,
        body: S,
        key: &str,
        content_type: Option<&str>,
        max_size: u64,
        budget: &QuotaBudget,
        reserved: &mut u64,
        cancel: &CancelSignal,
    ) -> Result<(Pumped, Option<String>)>
    where
        S: Stream<Item = std::result::Result<B, E>> + Send,
        B: AsRef<[u8]>,
        TransferError: From<E>,
    {
        let mut session = MultipartSession::open(
            self.store.clone(),
            self.uploader.clone(),
            key,
            content_type,
            self.config.presign_ttl(),
        )
        .await?;

        let limits = PumpLimits {
            part_size: usize::try_from(self.config.part_size).unwrap_or(usize::MAX),
            max_size,
            idle_timeout: self.config.request_timeout(),
        };

        match pump(Box::pin(body), &mut session, limits, budget, reserved, cancel).await {
            Ok(pumped) => {
                debug!(key, parts = session.part_count(), "Body consumed");
                let etag = session.complete().await?;
                Ok((pumped, etag))
            },
            Err(e) => {
                session.abort().await;
                Err(e)
            },
        }
    }
}
