//! Bulkport Worker Library
//!
//! Streams large user-supplied spreadsheets, re-hosts the media their rows
//! reference into object storage, and keeps a fleet of workers from
//! stepping on each other's folders.
//!
//! # Overview
//!
//! - **Locks** ([`lock`]): TTL-based mutual exclusion over hierarchical resource
//!   paths with heartbeat renewal and deadlock-free multi-path acquisition
//! - **Transfers** ([`transfer`]): remote download streamed into fixed-size
//!   multipart parts with quota, size and cancellation checks
//! - **Bulk requests** ([`bulk`]): the request state machine, the streaming
//!   sheet reader and the pluggable [`bulk::RowProcessor`] contract
//! - **Queue** ([`queue`]): Postgres work units with claim, heartbeat,
//!   retry, stall detection and retention
//! - **Catalog** ([`catalog`]): the media catalog import workload
//!
//! # Architecture
//!
//! Every external collaborator sits behind an `async_trait` port with a
//! Postgres/S3 adapter and an in-memory adapter:
//!
//! ```text
//! queue ──▶ BulkRequestService ──▶ SheetReader ──▶ RowProcessor
//!                 │                                    │
//!                 ├── LockManager ◀────────────────────┤
//!                 └── ObjectStore ◀── TransferPipeline ◀┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bulkport_worker::{config::Config, lock::{LockManager, MemoryLockStore}};
//! use bulkport_common::ResourcePath;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let store = Arc::new(MemoryLockStore::new(config.lock.registry_capacity));
//! let locks = LockManager::new(store, config.lock.clone());
//!
//! let folder = ResourcePath::parse("/companies/acme/catalog")?;
//! let held = locks.acquire("media-folders", &folder, &locks.default_options()).await?;
//! // ... mutate the folder ...
//! held.release().await;
//! # Ok(())
//! # }
//! ```

pub mod bulk;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod error;
pub mod lock;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod transfer;

// Re-export commonly used types
pub use error::{WorkerError, WorkerResult};

/// Apply the SQL migrations under `migrations/`
pub async fn run_migrations(pool: &sqlx::PgPool) -> WorkerResult<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
