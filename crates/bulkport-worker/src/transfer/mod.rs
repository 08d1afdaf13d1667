//! Chunked transfer pipeline
//!
//! Downloads remote media and re-uploads it into object storage without ever
//! holding a whole payload in memory:
//!
//! 1. the URL is validated against the scheme and extension allow-lists
//! 2. a time-bounded streaming `GET` is opened; a declared size is checked
//!    upfront against the size limit and the caller's [`QuotaBudget`]
//! 3. a multipart session is opened and the body is cut into fixed-size parts,
//!    each `PUT` to a short-lived pre-signed URL
//! 4. undeclared sizes are checked progressively; crossing a limit aborts the
//!    session at once
//! 5. the last part is flushed and the session completed
//!
//! Any failure aborts the open session before it propagates. Per-URL
//! failures are retried with backoff and reported in the [`BatchOutcome`];
//! only cancellation fails a whole batch, after deleting every object the
//! batch already stored.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::Cancelled;
use crate::storage::StorageError;

mod chunker;
mod pipeline;
mod quota;
mod session;
mod validation;

pub use pipeline::{BatchOptions, TransferPipeline};
pub use quota::{QuotaBudget, QuotaSource};
pub use session::{MultipartSession, PartUploader, PresignedPartUploader};
pub use validation::{destination_key, sanitize_file_name, UrlPolicy, ValidatedUrl};

/// Result type alias for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

/// Transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Invalid media URL: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("File too large: {actual} bytes exceeds the {limit} byte limit")]
    SizeExceeded { limit: u64, actual: u64 },

    #[error("Storage quota exceeded: {required} bytes required, {remaining} remaining")]
    QuotaExceeded { remaining: u64, required: u64 },

    #[error("Quota ledger error: {0}")]
    Quota(String),

    #[error("Remote file is empty")]
    Empty,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransferError::Timeout(e.to_string())
        } else {
            TransferError::Network(e.to_string())
        }
    }
}

impl TransferError {
    /// Worth another attempt after backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Network(_)
            | TransferError::Timeout(_)
            | TransferError::Storage(_)
            | TransferError::Quota(_) => true,
            TransferError::HttpStatus { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            },
            _ => false,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransferError::Cancelled(_))
    }

    /// Size or quota limit crossed
    pub fn is_limit(&self) -> bool {
        matches!(
            self,
            TransferError::SizeExceeded { .. } | TransferError::QuotaExceeded { .. }
        )
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            TransferError::Validation(_) | TransferError::Empty => FailureKind::Validation,
            TransferError::Network(_)
            | TransferError::Timeout(_)
            | TransferError::HttpStatus { .. } => FailureKind::Transient,
            TransferError::SizeExceeded { .. } | TransferError::QuotaExceeded { .. } => {
                FailureKind::Limit
            },
            TransferError::Storage(_) | TransferError::Quota(_) => FailureKind::Storage,
            TransferError::Cancelled(_) => FailureKind::Cancelled,
        }
    }
}

/// Coarse classification of a failed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Transient,
    Limit,
    Storage,
    Cancelled,
}

/// Why a single URL failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&TransferError> for TransferFailure {
    fn from(e: &TransferError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Outcome of transferring one URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub success: bool,
    pub original_url: String,
    pub storage_path: Option<String>,
    pub size: u64,
    pub mime_type: Option<String>,
    pub etag: Option<String>,
    /// Hex SHA-256 of the transferred bytes
    pub checksum: Option<String>,
    pub attempts: u32,
    pub error: Option<TransferFailure>,
}

impl TransferResult {
    pub(crate) fn failed(url: &str, attempts: u32, error: &TransferError) -> Self {
        Self {
            success: false,
            original_url: url.to_string(),
            storage_path: None,
            size: 0,
            mime_type: None,
            etag: None,
            checksum: None,
            attempts,
            error: Some(error.into()),
        }
    }
}

/// Per-URL results of a batch plus aggregates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// One entry per input URL, in input order
    pub results: Vec<TransferResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub total_bytes: u64,
}

impl BatchOutcome {
    pub(crate) fn from_results(results: Vec<TransferResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        let total_bytes = results.iter().filter(|r| r.success).map(|r| r.size).sum();
        Self {
            failed: results.len() - succeeded,
            succeeded,
            total_bytes,
            results,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::Checkpoint;

    #[test]
    fn test_retry_classification() {
        assert!(TransferError::Network("reset".into()).is_retryable());
        assert!(TransferError::HttpStatus { status: 503, url: "u".into() }.is_retryable());
        assert!(TransferError::HttpStatus { status: 429, url: "u".into() }.is_retryable());
        assert!(!TransferError::HttpStatus { status: 404, url: "u".into() }.is_retryable());
        assert!(!TransferError::QuotaExceeded { remaining: 1, required: 2 }.is_retryable());
        assert!(!TransferError::Empty.is_retryable());

        let cancelled = TransferError::from(Cancelled {
            checkpoint: Checkpoint::PartBoundary,
        });
        assert!(cancelled.is_cancellation());
        assert!(!cancelled.is_retryable());
    }

    #[test]
    fn test_batch_outcome_aggregates() {
        let ok = TransferResult {
            success: true,
            original_url: "a".into(),
            storage_path: Some("k".into()),
            size: 10,
            mime_type: None,
            etag: None,
            checksum: None,
            attempts: 1,
            error: None,
        };
        let bad = TransferResult::failed("b", 3, &TransferError::Empty);
        let outcome = BatchOutcome::from_results(vec![ok, bad]);

        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.total_bytes, 10);
        assert_eq!(outcome.results[1].error.as_ref().map(|e| e.kind), Some(FailureKind::Validation));
    }
}
