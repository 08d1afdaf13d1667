//! Shared harness: the whole pipeline on in-memory ports plus a wiremock
//! server that serves media and accepts pre-signed part uploads.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Map;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use bulkport_worker::bulk::{
    BulkError, BulkJob, BulkRequestService, BulkRequestStore, EventType, FileStatus, JobHandle, JobOptions,
    MemoryBulkStore, NewBulkRequest, Result, ScheduleOptions, SourceFile,
};
use bulkport_worker::catalog::{CatalogSettings, MediaCatalogProcessor, MemoryCatalog, PROCESSOR_NAME};
use bulkport_worker::config::Config;
use bulkport_worker::lock::{LockManager, MemoryLockStore};
use bulkport_worker::storage::MemoryObjectStore;
use bulkport_worker::transfer::TransferPipeline;

pub const PART_SIZE: u64 = 1024;

/// Defaults with small parts and no waiting
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.transfer.part_size = PART_SIZE;
    config.transfer.batch_pause_ms = 0;
    config.transfer.backoff_base_ms = 1;
    config.transfer.backoff_max_ms = 5;
    config.transfer.request_timeout_secs = 5;
    config.bulk.cancel_poll_ms = 0;
    config.bulk.media_page_size = 2;
    config.bulk.delete_page_size = 7;
    config.lock.acquire_timeout_ms = 200;
    config
}

type CancelWhen = Box<dyn Fn() -> bool + Send + Sync>;

/// [`JobHandle`] that records what the service asked of the dispatcher
#[derive(Default)]
pub struct RecordingJobHandle {
    progress: Mutex<Vec<u8>>,
    scheduled: Mutex<Vec<(BulkJob, ScheduleOptions)>>,
    cancel_when: Option<CancelWhen>,
    fail_progress: bool,
    fail_schedule: bool,
}

impl RecordingJobHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Report cancellation once `condition` holds
    pub fn cancelling_when(condition: impl Fn() -> bool + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            cancel_when: Some(Box::new(condition)),
            ..Self::default()
        })
    }

    /// Every progress update fails
    pub fn failing_progress() -> Arc<Self> {
        Arc::new(Self {
            fail_progress: true,
            ..Self::default()
        })
    }

    /// Every follow-up unit is refused
    pub fn failing_schedule() -> Arc<Self> {
        Arc::new(Self {
            fail_schedule: true,
            ..Self::default()
        })
    }

    pub fn progress(&self) -> Vec<u8> {
        self.progress.lock().unwrap().clone()
    }

    pub fn scheduled(&self) -> Vec<BulkJob> {
        self.scheduled
            .lock()
            .unwrap()
            .iter()
            .map(|(job, _)| job.clone())
            .collect()
    }

    pub fn schedule_options(&self) -> Vec<ScheduleOptions> {
        self.scheduled
            .lock()
            .unwrap()
            .iter()
            .map(|(_, options)| *options)
            .collect()
    }

    pub fn scheduled_events(&self) -> Vec<EventType> {
        self.scheduled().iter().map(|job| job.event_type).collect()
    }
}

#[async_trait]
impl JobHandle for RecordingJobHandle {
    async fn update_progress(&self, percent: u8) -> Result<()> {
        if self.fail_progress {
            return Err(BulkError::Persistence("progress channel closed".to_string()));
        }
        self.progress.lock().unwrap().push(percent);
        Ok(())
    }

    async fn is_cancel_requested(&self) -> Result<bool> {
        Ok(self.cancel_when.as_ref().is_some_and(|f| f()))
    }

    async fn schedule(&self, job: BulkJob, options: ScheduleOptions) -> Result<()> {
        if self.fail_schedule {
            return Err(BulkError::Persistence("queue unavailable".to_string()));
        }
        self.scheduled.lock().unwrap().push((job, options));
        Ok(())
    }
}

pub struct Harness {
    pub server: MockServer,
    pub config: Config,
    pub store: MemoryBulkStore,
    pub objects: Arc<MemoryObjectStore>,
    pub catalog: MemoryCatalog,
    pub locks: LockManager,
    pub service: Arc<BulkRequestService>,
    pub company_id: Uuid,
    pub user_id: Uuid,
}

impl Harness {
    pub async fn start() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/parts/[0-9a-f]+/\d+$"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"part\""))
            .mount(&server)
            .await;

        let objects = Arc::new(MemoryObjectStore::new(format!("{}/parts", server.uri())));
        let locks = LockManager::new(
            Arc::new(MemoryLockStore::new(config.lock.registry_capacity)),
            config.lock.clone(),
        );
        let store = MemoryBulkStore::new();
        let catalog = MemoryCatalog::new();

        let transfers = Arc::new(
            TransferPipeline::new(objects.clone(), config.transfer.clone())
                .expect("transfer pipeline"),
        );
        let processor = MediaCatalogProcessor::new(
            Arc::new(catalog.clone()),
            Arc::new(store.clone()),
            transfers,
            locks.clone(),
            CatalogSettings::from_config(&config),
        );
        let service = Arc::new(
            BulkRequestService::new(
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                objects.clone(),
                locks.clone(),
                config.bulk.clone(),
            )
            .register(Arc::new(processor)),
        );

        Self {
            server,
            config,
            store,
            objects,
            catalog,
            locks,
            service,
            company_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        }
    }

    pub fn media_url(&self, name: &str) -> String {
        format!("{}/media/{}", self.server.uri(), name)
    }

    /// Serve `size` bytes at `/media/{name}`
    pub async fn serve_media(&self, name: &str, size: usize) {
        Mock::given(method("GET"))
            .and(path(format!("/media/{}", name)))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "image/jpeg")
                    .set_body_bytes(vec![0xAB; size]),
            )
            .mount(&self.server)
            .await;
    }

    /// Upload a sheet, create its request and return the first work unit
    pub async fn submit(&self, csv: &str, options: JobOptions) -> BulkJob {
        let file_id = Uuid::new_v4();
        let request_id = Uuid::new_v4();
        let storage_key = format!("uploads/{}/items.csv", file_id);

        self.objects.put_object(&storage_key, csv.as_bytes().to_vec());
        self.store.insert_file(SourceFile {
            id: file_id,
            company_id: self.company_id,
            name: "items.csv".to_string(),
            storage_key,
            status: FileStatus::Uploaded,
        });
        self.store
            .create(&NewBulkRequest {
                id: request_id,
                company_id: self.company_id,
                requested_by: self.user_id,
                file_id,
                file_name: "items.csv".to_string(),
                processor: PROCESSOR_NAME.to_string(),
                total_rows: options.total_rows,
                metadata: Map::new(),
            })
            .await
            .expect("create request");

        BulkJob {
            request_id,
            event_type: EventType::ProcessFile,
            file_id,
            file_name: "items.csv".to_string(),
            company_id: self.company_id,
            user_id: self.user_id,
            processor: PROCESSOR_NAME.to_string(),
            options,
            metadata: Map::new(),
        }
    }
}

/// `sku,title,description,price,media_urls` sheet from `(sku, title, media)` rows
pub fn catalog_sheet(rows: &[(&str, &str, &str)]) -> String {
    let mut csv = String::from("sku,title,description,price,media_urls\n");
    for (sku, title, media) in rows {
        csv.push_str(&format!("{},{},,9.99,{}\n", sku, title, media));
    }
    csv
}
