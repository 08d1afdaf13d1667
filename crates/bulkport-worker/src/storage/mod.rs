//! Object storage port
//!
//! [`ObjectStore`] is everything the pipeline needs from object storage:
//! streaming reads of source files, the four multipart calls, and existence,
//! deletion and folder markers. [`S3Storage`] talks to S3-compatible services,
//! [`MemoryObjectStore`] keeps state in process for tests and local runs.

use async_trait::async_trait;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;

mod memory;
mod s3;

pub use memory::MemoryObjectStore;
pub use s3::S3Storage;

/// Result type alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors raised by object storage adapters
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Unknown multipart upload {upload_id} for {key}")]
    UnknownUpload { key: String, upload_id: String },

    #[error("Storage {operation} failed for '{key}': {message}")]
    Request {
        operation: &'static str,
        key: String,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub(crate) fn request(operation: &'static str, key: &str, message: impl Into<String>) -> Self {
        StorageError::Request {
            operation,
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Streaming body of a stored object
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// An open multipart upload session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUpload {
    pub key: String,
    pub upload_id: String,
}

/// A part accepted by the storage backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a streaming read of an object
    async fn open_read(&self, key: &str) -> StorageResult<ObjectReader>;

    /// Start a multipart upload for `key`
    async fn initiate_multipart(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> StorageResult<MultipartUpload>;

    /// A short-lived URL accepting an HTTP `PUT` of one part
    async fn presign_part(
        &self,
        upload: &MultipartUpload,
        part_number: i32,
        expires_in: Duration,
    ) -> StorageResult<String>;

    /// Assemble the uploaded parts into the final object, returning its ETag
    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[CompletedPart],
    ) -> StorageResult<Option<String>>;

    /// Discard an upload and every part uploaded to it
    async fn abort_multipart(&self, upload: &MultipartUpload) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Create an empty folder marker (`{prefix}/`)
    async fn create_folder(&self, prefix: &str) -> StorageResult<()>;
}
