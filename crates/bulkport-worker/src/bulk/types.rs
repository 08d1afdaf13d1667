use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Metadata key holding the source file status to restore after the job
pub const ORIGINAL_FILE_STATUS: &str = "originalFileStatus";

/// Bulk request status
///
/// `PENDING → PROCESSING → {COMPLETED | FAILED}` or
/// `PROCESSING → CANCELLING → CANCELLED`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkStatus {
    Pending,
    Processing,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl BulkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkStatus::Pending => "PENDING",
            BulkStatus::Processing => "PROCESSING",
            BulkStatus::Cancelling => "CANCELLING",
            BulkStatus::Cancelled => "CANCELLED",
            BulkStatus::Completed => "COMPLETED",
            BulkStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BulkStatus::Cancelled | BulkStatus::Completed | BulkStatus::Failed
        )
    }

    /// States reachable in one step
    pub fn next_states(&self) -> &'static [BulkStatus] {
        match self {
            BulkStatus::Pending => &[BulkStatus::Processing],
            BulkStatus::Processing => &[
                BulkStatus::Completed,
                BulkStatus::Failed,
                BulkStatus::Cancelling,
            ],
            BulkStatus::Cancelling => &[BulkStatus::Cancelled],
            BulkStatus::Cancelled | BulkStatus::Completed | BulkStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: BulkStatus) -> bool {
        self.next_states().contains(&next)
    }

    /// Shortest chain of steps from `self` to `target`, excluding `self`
    pub fn path_to(&self, target: BulkStatus) -> Option<Vec<BulkStatus>> {
        if *self == target {
            return Some(Vec::new());
        }
        for next in self.next_states() {
            if let Some(mut rest) = next.path_to(target) {
                rest.insert(0, *next);
                return Some(rest);
            }
        }
        None
    }
}

impl From<String> for BulkStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "PROCESSING" => BulkStatus::Processing,
            "CANCELLING" => BulkStatus::Cancelling,
            "CANCELLED" => BulkStatus::Cancelled,
            "COMPLETED" => BulkStatus::Completed,
            "FAILED" => BulkStatus::Failed,
            _ => BulkStatus::Pending,
        }
    }
}

impl fmt::Display for BulkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row counters of a request; never decrease while processing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCounters {
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
}

impl RowCounters {
    pub fn record(&mut self, success: bool) {
        self.processed += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// One ingestion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkRequest {
    pub id: Uuid,
    pub company_id: Uuid,
    pub requested_by: Uuid,
    pub file_id: Uuid,
    pub file_name: String,
    pub processor: String,
    pub status: BulkStatus,
    pub total_rows: Option<u64>,
    #[serde(flatten)]
    pub counters: RowCounters,
    pub progress: u8,
    pub error_message: Option<String>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BulkRequest {
    pub fn original_file_status(&self) -> Option<FileStatus> {
        self.metadata
            .get(ORIGINAL_FILE_STATUS)
            .and_then(Value::as_str)
            .map(|s| FileStatus::from(s.to_string()))
    }
}

/// Fields of a request at creation
#[derive(Debug, Clone)]
pub struct NewBulkRequest {
    pub id: Uuid,
    pub company_id: Uuid,
    pub requested_by: Uuid,
    pub file_id: Uuid,
    pub file_name: String,
    pub processor: String,
    pub total_rows: Option<u64>,
    pub metadata: Map<String, Value>,
}

/// Column updates applied together with a status change
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub error_message: Option<String>,
    pub progress: Option<u8>,
    pub total_rows: Option<u64>,
}

impl TransitionPatch {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn progress(percent: u8) -> Self {
        Self {
            progress: Some(percent),
            ..Self::default()
        }
    }
}

/// Outcome record for one spreadsheet row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowLog {
    pub row_number: u64,
    pub entity_id: Option<String>,
    pub entity_type: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metadata: Map<String, Value>,
    pub processed_at: DateTime<Utc>,
}

/// Status of the uploaded source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Uploaded,
    Processing,
    Processed,
    Deleted,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Uploaded => "uploaded",
            FileStatus::Processing => "processing",
            FileStatus::Processed => "processed",
            FileStatus::Deleted => "deleted",
        }
    }
}

impl From<String> for FileStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "processing" => FileStatus::Processing,
            "processed" => FileStatus::Processed,
            "deleted" => FileStatus::Deleted,
            _ => FileStatus::Uploaded,
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded spreadsheet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub id: Uuid,
    pub company_id: Uuid,
    pub name: String,
    pub storage_key: String,
    pub status: FileStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        for status in [BulkStatus::Completed, BulkStatus::Failed, BulkStatus::Cancelled] {
            assert!(status.is_terminal());
            assert!(status.next_states().is_empty());
            assert_eq!(status.path_to(BulkStatus::Processing), None);
        }
    }

    #[test]
    fn test_cancelled_only_from_cancelling() {
        assert!(!BulkStatus::Processing.can_transition_to(BulkStatus::Cancelled));
        assert!(!BulkStatus::Pending.can_transition_to(BulkStatus::Cancelling));
        assert_eq!(
            BulkStatus::Pending.path_to(BulkStatus::Cancelled),
            Some(vec![
                BulkStatus::Processing,
                BulkStatus::Cancelling,
                BulkStatus::Cancelled
            ])
        );
        assert_eq!(BulkStatus::Cancelling.path_to(BulkStatus::Failed), None);
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            BulkStatus::Pending,
            BulkStatus::Processing,
            BulkStatus::Cancelling,
            BulkStatus::Cancelled,
            BulkStatus::Completed,
            BulkStatus::Failed,
        ] {
            assert_eq!(BulkStatus::from(status.as_str().to_string()), status);
        }
        assert_eq!(
            serde_json::to_string(&BulkStatus::Cancelling).unwrap(),
            "\"CANCELLING\""
        );
    }

    #[test]
    fn test_counters_record() {
        let mut counters = RowCounters::default();
        counters.record(true);
        counters.record(false);
        counters.record(true);
        assert_eq!(
            counters,
            RowCounters {
                processed: 3,
                successful: 2,
                failed: 1
            }
        );
    }
}
