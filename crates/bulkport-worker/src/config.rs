//! Configuration management
//!
//! Everything is read from the environment (a `.env` file is honoured) with
//! the defaults below. [`Config::validate`] rejects combinations the worker
//! cannot run with.

use bulkport_common::units::{parse_bytes, MIB};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::lock::MAX_LOCK_TTL;
use crate::retry::Backoff;

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/bulkport";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Object Storage Configuration Constants
// ============================================================================

/// Default region sent to the S3 API.
pub const DEFAULT_STORAGE_REGION: &str = "us-east-1";

/// Default bucket holding uploads and transferred media.
pub const DEFAULT_STORAGE_BUCKET: &str = "bulkport-data";

/// Local MinIO endpoint used when nothing is configured.
pub const DEFAULT_STORAGE_ENDPOINT: &str = "http://localhost:9000";

/// Local MinIO credentials.
pub const DEFAULT_STORAGE_CREDENTIAL: &str = "minioadmin";

// ============================================================================
// Lock Configuration Constants
// ============================================================================

/// Default lock TTL in milliseconds.
pub const DEFAULT_LOCK_TTL_MS: u64 = 30_000;

/// Default time budget for acquiring a lock set in milliseconds.
pub const DEFAULT_LOCK_ACQUIRE_TIMEOUT_MS: u64 = 10_000;

/// Default first backoff step between acquisition attempts.
pub const DEFAULT_LOCK_BACKOFF_BASE_MS: u64 = 50;

/// Default backoff cap between acquisition attempts.
pub const DEFAULT_LOCK_BACKOFF_MAX_MS: u64 = 2_000;

/// Default heartbeat period as a fraction of the TTL.
pub const DEFAULT_LOCK_HEARTBEAT_RATIO: f64 = 0.6;

/// Default size of the in-memory lock registry.
pub const DEFAULT_LOCK_REGISTRY_CAPACITY: usize = 10_000;

// ============================================================================
// Transfer Configuration Constants
// ============================================================================

/// Smallest part S3 accepts for every part but the last.
pub const MIN_PART_SIZE: u64 = 5 * MIB;

/// Default multipart part size.
pub const DEFAULT_TRANSFER_PART_SIZE: u64 = 8 * MIB;

/// Default maximum size of a single transferred file.
pub const DEFAULT_TRANSFER_MAX_FILE_SIZE: u64 = 500 * MIB;

/// Default number of concurrent downloads per batch group.
pub const DEFAULT_TRANSFER_CONCURRENCY: usize = 2;

/// Upper bound on concurrent downloads; each one holds a full part buffer.
pub const MAX_TRANSFER_CONCURRENCY: usize = 3;

/// Default attempts per URL, including the first one.
pub const DEFAULT_TRANSFER_MAX_ATTEMPTS: u32 = 3;

pub const DEFAULT_TRANSFER_BACKOFF_BASE_MS: u64 = 500;
pub const DEFAULT_TRANSFER_BACKOFF_MAX_MS: u64 = 8_000;
pub const DEFAULT_TRANSFER_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_TRANSFER_PART_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_TRANSFER_BATCH_PAUSE_MS: u64 = 250;
pub const DEFAULT_TRANSFER_PRESIGN_TTL_SECS: u64 = 900;

/// Default extension allow-list for remote media.
pub const DEFAULT_TRANSFER_ALLOWED_EXTENSIONS: &str =
    "jpg,jpeg,png,gif,webp,svg,bmp,tif,tiff,mp4,mov,webm,avi,mp3,wav,pdf,doc,docx,xls,xlsx,csv,txt,zip";

/// Default URL schemes accepted for remote media.
pub const DEFAULT_TRANSFER_ALLOWED_SCHEMES: &str = "http,https";

// ============================================================================
// Bulk Request Configuration Constants
// ============================================================================

/// Default number of rows between counter flushes.
pub const DEFAULT_BULK_FLUSH_EVERY: u64 = 25;

/// Default cap on persisted row logs per request.
pub const DEFAULT_BULK_MAX_ROW_LOGS: usize = 5_000;

/// Default page size for the media phase of two-phase requests.
pub const DEFAULT_BULK_MEDIA_PAGE_SIZE: usize = 50;

/// Default page size when deleting entities of a cancelled request.
pub const DEFAULT_BULK_DELETE_PAGE_SIZE: usize = 500;

/// Default number of media passes before busy folders are given up on.
pub const DEFAULT_BULK_MEDIA_PASSES: u32 = 5;

/// Default delay before another media pass over busy folders.
pub const DEFAULT_BULK_MEDIA_RETRY_DELAY_SECS: u64 = 30;

pub const DEFAULT_BULK_CLEANUP_DELAY_SECS: u64 = 3_600;
pub const DEFAULT_BULK_CLEANUP_ATTEMPTS: u32 = 3;
pub const DEFAULT_BULK_CLEANUP_RETENTION_SECS: u64 = 86_400;

/// Default minimum interval between cancellation probes.
pub const DEFAULT_BULK_CANCEL_POLL_MS: u64 = 1_000;

pub const DEFAULT_BULK_FILE_LOCK_NAMESPACE: &str = "source-files";
pub const DEFAULT_BULK_MEDIA_LOCK_NAMESPACE: &str = "media-folders";

// ============================================================================
// Worker Configuration Constants
// ============================================================================

pub const DEFAULT_WORKER_CONCURRENCY: usize = 1;
pub const DEFAULT_WORKER_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_WORKER_HEARTBEAT_SECS: u64 = 15;
pub const DEFAULT_WORKER_STALL_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_WORKER_MAX_ATTEMPTS: u32 = 3;

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub lock: LockConfig,
    pub transfer: TransferConfig,
    pub bulk: BulkConfig,
    pub worker: WorkerConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// S3-compatible object storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Custom endpoint (MinIO); AWS when unset
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    #[serde(skip_serializing, default)]
    pub secret_key: String,
    /// Bucket in the path rather than the host name
    pub path_style: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: Some(DEFAULT_STORAGE_ENDPOINT.to_string()),
            region: DEFAULT_STORAGE_REGION.to_string(),
            bucket: DEFAULT_STORAGE_BUCKET.to_string(),
            access_key: DEFAULT_STORAGE_CREDENTIAL.to_string(),
            secret_key: DEFAULT_STORAGE_CREDENTIAL.to_string(),
            path_style: true,
        }
    }
}

/// Where lock state lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    #[default]
    Postgres,
    Memory,
}

impl FromStr for LockBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "pg" => Ok(LockBackend::Postgres),
            "memory" | "mem" => Ok(LockBackend::Memory),
            other => Err(format!("unknown lock backend: {}", other)),
        }
    }
}

/// Distributed lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    pub backend: LockBackend,
    pub ttl_ms: u64,
    pub acquire_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub heartbeat_ratio: f64,
    pub strict_siblings: bool,
    pub registry_capacity: usize,
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::default(),
            ttl_ms: DEFAULT_LOCK_TTL_MS,
            acquire_timeout_ms: DEFAULT_LOCK_ACQUIRE_TIMEOUT_MS,
            backoff_base_ms: DEFAULT_LOCK_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_LOCK_BACKOFF_MAX_MS,
            heartbeat_ratio: DEFAULT_LOCK_HEARTBEAT_RATIO,
            strict_siblings: false,
            registry_capacity: DEFAULT_LOCK_REGISTRY_CAPACITY,
        }
    }
}

/// Download and multipart upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub part_size: u64,
    pub max_file_size: u64,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub request_timeout_secs: u64,
    pub part_timeout_secs: u64,
    pub batch_pause_ms: u64,
    pub presign_ttl_secs: u64,
    pub allowed_extensions: Vec<String>,
    pub allowed_schemes: Vec<String>,
}

impl TransferConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn part_timeout(&self) -> Duration {
        Duration::from_secs(self.part_timeout_secs)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_TRANSFER_PART_SIZE,
            max_file_size: DEFAULT_TRANSFER_MAX_FILE_SIZE,
            concurrency: DEFAULT_TRANSFER_CONCURRENCY,
            max_attempts: DEFAULT_TRANSFER_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_TRANSFER_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_TRANSFER_BACKOFF_MAX_MS,
            request_timeout_secs: DEFAULT_TRANSFER_REQUEST_TIMEOUT_SECS,
            part_timeout_secs: DEFAULT_TRANSFER_PART_TIMEOUT_SECS,
            batch_pause_ms: DEFAULT_TRANSFER_BATCH_PAUSE_MS,
            presign_ttl_secs: DEFAULT_TRANSFER_PRESIGN_TTL_SECS,
            allowed_extensions: split_list(DEFAULT_TRANSFER_ALLOWED_EXTENSIONS),
            allowed_schemes: split_list(DEFAULT_TRANSFER_ALLOWED_SCHEMES),
        }
    }
}

/// Bulk request processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    pub flush_every: u64,
    pub max_row_logs: usize,
    pub media_page_size: usize,
    pub delete_page_size: usize,
    /// Media passes allowed while item folders stay locked elsewhere
    pub media_passes: u32,
    pub media_retry_delay_secs: u64,
    pub cleanup_delay_secs: u64,
    pub cleanup_attempts: u32,
    pub cleanup_retention_secs: u64,
    pub cancel_poll_ms: u64,
    pub file_lock_namespace: String,
    pub media_lock_namespace: String,
}

impl BulkConfig {
    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_ms)
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            flush_every: DEFAULT_BULK_FLUSH_EVERY,
            max_row_logs: DEFAULT_BULK_MAX_ROW_LOGS,
            media_page_size: DEFAULT_BULK_MEDIA_PAGE_SIZE,
            delete_page_size: DEFAULT_BULK_DELETE_PAGE_SIZE,
            media_passes: DEFAULT_BULK_MEDIA_PASSES,
            media_retry_delay_secs: DEFAULT_BULK_MEDIA_RETRY_DELAY_SECS,
            cleanup_delay_secs: DEFAULT_BULK_CLEANUP_DELAY_SECS,
            cleanup_attempts: DEFAULT_BULK_CLEANUP_ATTEMPTS,
            cleanup_retention_secs: DEFAULT_BULK_CLEANUP_RETENTION_SECS,
            cancel_poll_ms: DEFAULT_BULK_CANCEL_POLL_MS,
            file_lock_namespace: DEFAULT_BULK_FILE_LOCK_NAMESPACE.to_string(),
            media_lock_namespace: DEFAULT_BULK_MEDIA_LOCK_NAMESPACE.to_string(),
        }
    }
}

/// Queue worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub heartbeat_secs: u64,
    pub stall_timeout_secs: u64,
    pub max_attempts: u32,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            poll_interval_ms: DEFAULT_WORKER_POLL_INTERVAL_MS,
            heartbeat_secs: DEFAULT_WORKER_HEARTBEAT_SECS,
            stall_timeout_secs: DEFAULT_WORKER_STALL_TIMEOUT_SECS,
            max_attempts: DEFAULT_WORKER_MAX_ATTEMPTS,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// First non-empty value among `keys`
fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

fn env_bytes_or(key: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(key) {
        Ok(raw) => parse_bytes(&raw).map_err(|e| anyhow::anyhow!("{}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_start_matches('.').to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let requested_concurrency = env_or("TRANSFER_CONCURRENCY", DEFAULT_TRANSFER_CONCURRENCY);
        let concurrency = requested_concurrency.clamp(1, MAX_TRANSFER_CONCURRENCY);
        if concurrency != requested_concurrency {
            tracing::warn!(
                requested = requested_concurrency,
                applied = concurrency,
                "TRANSFER_CONCURRENCY clamped"
            );
        }

        let config = Config {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or("DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            },
            storage: StorageConfig {
                endpoint: env_first(&["S3_ENDPOINT"]),
                region: env_or("S3_REGION", DEFAULT_STORAGE_REGION.to_string()),
                bucket: env_or("S3_BUCKET", DEFAULT_STORAGE_BUCKET.to_string()),
                access_key: env_first(&["S3_ACCESS_KEY", "AWS_ACCESS_KEY_ID"])
                    .unwrap_or_else(|| DEFAULT_STORAGE_CREDENTIAL.to_string()),
                secret_key: env_first(&["S3_SECRET_KEY", "AWS_SECRET_ACCESS_KEY"])
                    .unwrap_or_else(|| DEFAULT_STORAGE_CREDENTIAL.to_string()),
                path_style: env_or("S3_PATH_STYLE", false),
            },
            lock: LockConfig {
                backend: env_or("LOCK_BACKEND", LockBackend::default()),
                ttl_ms: env_or("LOCK_TTL_MS", DEFAULT_LOCK_TTL_MS),
                acquire_timeout_ms: env_or("LOCK_ACQUIRE_TIMEOUT_MS", DEFAULT_LOCK_ACQUIRE_TIMEOUT_MS),
                backoff_base_ms: env_or("LOCK_BACKOFF_BASE_MS", DEFAULT_LOCK_BACKOFF_BASE_MS),
                backoff_max_ms: env_or("LOCK_BACKOFF_MAX_MS", DEFAULT_LOCK_BACKOFF_MAX_MS),
                heartbeat_ratio: env_or("LOCK_HEARTBEAT_RATIO", DEFAULT_LOCK_HEARTBEAT_RATIO),
                strict_siblings: env_or("LOCK_STRICT_SIBLINGS", false),
                registry_capacity: env_or("LOCK_REGISTRY_CAPACITY", DEFAULT_LOCK_REGISTRY_CAPACITY),
            },
            transfer: TransferConfig {
                part_size: env_bytes_or("TRANSFER_PART_SIZE", DEFAULT_TRANSFER_PART_SIZE)?,
                max_file_size: env_bytes_or("TRANSFER_MAX_FILE_SIZE", DEFAULT_TRANSFER_MAX_FILE_SIZE)?,
                concurrency,
                max_attempts: env_or("TRANSFER_MAX_ATTEMPTS", DEFAULT_TRANSFER_MAX_ATTEMPTS),
                backoff_base_ms: env_or("TRANSFER_BACKOFF_BASE_MS", DEFAULT_TRANSFER_BACKOFF_BASE_MS),
                backoff_max_ms: env_or("TRANSFER_BACKOFF_MAX_MS", DEFAULT_TRANSFER_BACKOFF_MAX_MS),
                request_timeout_secs: env_or(
                    "TRANSFER_REQUEST_TIMEOUT_SECS",
                    DEFAULT_TRANSFER_REQUEST_TIMEOUT_SECS,
                ),
                part_timeout_secs: env_or("TRANSFER_PART_TIMEOUT_SECS", DEFAULT_TRANSFER_PART_TIMEOUT_SECS),
                batch_pause_ms: env_or("TRANSFER_BATCH_PAUSE_MS", DEFAULT_TRANSFER_BATCH_PAUSE_MS),
                presign_ttl_secs: env_or("TRANSFER_PRESIGN_TTL_SECS", DEFAULT_TRANSFER_PRESIGN_TTL_SECS),
                allowed_extensions: split_list(
                    &std::env::var("TRANSFER_ALLOWED_EXTENSIONS")
                        .unwrap_or_else(|_| DEFAULT_TRANSFER_ALLOWED_EXTENSIONS.to_string()),
                ),
                allowed_schemes: split_list(
                    &std::env::var("TRANSFER_ALLOWED_SCHEMES")
                        .unwrap_or_else(|_| DEFAULT_TRANSFER_ALLOWED_SCHEMES.to_string()),
                ),
            },
            bulk: BulkConfig {
                flush_every: env_or("BULK_FLUSH_EVERY", DEFAULT_BULK_FLUSH_EVERY),
                max_row_logs: env_or("BULK_MAX_ROW_LOGS", DEFAULT_BULK_MAX_ROW_LOGS),
                media_page_size: env_or("BULK_MEDIA_PAGE_SIZE", DEFAULT_BULK_MEDIA_PAGE_SIZE),
                delete_page_size: env_or("BULK_DELETE_PAGE_SIZE", DEFAULT_BULK_DELETE_PAGE_SIZE),
                media_passes: env_or("BULK_MEDIA_PASSES", DEFAULT_BULK_MEDIA_PASSES),
                media_retry_delay_secs: env_or(
                    "BULK_MEDIA_RETRY_DELAY_SECS",
                    DEFAULT_BULK_MEDIA_RETRY_DELAY_SECS,
                ),
                cleanup_delay_secs: env_or("BULK_CLEANUP_DELAY_SECS", DEFAULT_BULK_CLEANUP_DELAY_SECS),
                cleanup_attempts: env_or("BULK_CLEANUP_ATTEMPTS", DEFAULT_BULK_CLEANUP_ATTEMPTS),
                cleanup_retention_secs: env_or(
                    "BULK_CLEANUP_RETENTION_SECS",
                    DEFAULT_BULK_CLEANUP_RETENTION_SECS,
                ),
                cancel_poll_ms: env_or("BULK_CANCEL_POLL_MS", DEFAULT_BULK_CANCEL_POLL_MS),
                file_lock_namespace: std::env::var("BULK_FILE_LOCK_NAMESPACE")
                    .unwrap_or_else(|_| DEFAULT_BULK_FILE_LOCK_NAMESPACE.to_string()),
                media_lock_namespace: std::env::var("BULK_MEDIA_LOCK_NAMESPACE")
                    .unwrap_or_else(|_| DEFAULT_BULK_MEDIA_LOCK_NAMESPACE.to_string()),
            },
            worker: WorkerConfig {
                concurrency: env_or("WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY),
                poll_interval_ms: env_or("WORKER_POLL_INTERVAL_MS", DEFAULT_WORKER_POLL_INTERVAL_MS),
                heartbeat_secs: env_or("WORKER_HEARTBEAT_SECS", DEFAULT_WORKER_HEARTBEAT_SECS),
                stall_timeout_secs: env_or("WORKER_STALL_TIMEOUT_SECS", DEFAULT_WORKER_STALL_TIMEOUT_SECS),
                max_attempts: env_or("WORKER_MAX_ATTEMPTS", DEFAULT_WORKER_MAX_ATTEMPTS),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.lock.ttl_ms == 0 {
            anyhow::bail!("LOCK_TTL_MS must be greater than 0");
        }

        if self.lock.ttl() > MAX_LOCK_TTL {
            anyhow::bail!(
                "LOCK_TTL_MS ({}) exceeds the maximum of {} ms",
                self.lock.ttl_ms,
                MAX_LOCK_TTL.as_millis()
            );
        }

        if !(self.lock.heartbeat_ratio > 0.0 && self.lock.heartbeat_ratio < 1.0) {
            anyhow::bail!(
                "LOCK_HEARTBEAT_RATIO must be between 0 and 1 (exclusive), got {}",
                self.lock.heartbeat_ratio
            );
        }

        if self.storage.bucket.trim().is_empty() {
            anyhow::bail!("S3_BUCKET cannot be empty");
        }

        if self.lock.registry_capacity == 0 {
            anyhow::bail!("LOCK_REGISTRY_CAPACITY must be greater than 0");
        }

        if self.transfer.part_size < MIN_PART_SIZE {
            anyhow::bail!(
                "TRANSFER_PART_SIZE ({} bytes) is below the storage minimum of {} bytes",
                self.transfer.part_size,
                MIN_PART_SIZE
            );
        }

        if self.transfer.max_file_size == 0 {
            anyhow::bail!("TRANSFER_MAX_FILE_SIZE must be greater than 0");
        }

        if self.transfer.max_attempts == 0 {
            anyhow::bail!("TRANSFER_MAX_ATTEMPTS must be at least 1");
        }

        if self.transfer.allowed_schemes.is_empty() {
            anyhow::bail!("TRANSFER_ALLOWED_SCHEMES cannot be empty");
        }

        if self.bulk.flush_every == 0 {
            anyhow::bail!("BULK_FLUSH_EVERY must be greater than 0");
        }

        if self.bulk.media_page_size == 0 || self.bulk.delete_page_size == 0 {
            anyhow::bail!("BULK_MEDIA_PAGE_SIZE and BULK_DELETE_PAGE_SIZE must be greater than 0");
        }

        if self.bulk.media_passes == 0 {
            anyhow::bail!("BULK_MEDIA_PASSES must be greater than 0");
        }

        if self.worker.concurrency == 0 {
            anyhow::bail!("WORKER_CONCURRENCY must be greater than 0");
        }

        if self.worker.stall_timeout_secs <= self.worker.heartbeat_secs {
            anyhow::bail!(
                "WORKER_STALL_TIMEOUT_SECS ({}) must exceed WORKER_HEARTBEAT_SECS ({})",
                self.worker.stall_timeout_secs,
                self.worker.heartbeat_secs
            );
        }

        if self.transfer.allowed_extensions.is_empty() {
            tracing::warn!("No extension allow-list configured - every extension will be accepted");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            storage: StorageConfig::default(),
            lock: LockConfig::default(),
            transfer: TransferConfig::default(),
            bulk: BulkConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}
