use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::Result;
use crate::cancel::CancelSignal;
use crate::config::BulkConfig;

/// What a dispatched work unit asks the service to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    /// Stream the spreadsheet through the processor
    ProcessFile,
    /// Second phase of a two-phase request
    MediaTransfer,
    /// Delete the source file once the request is done
    Cleanup,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ProcessFile => "process-file",
            EventType::MediaTransfer => "media-transfer",
            EventType::Cleanup => "cleanup",
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "media-transfer" => EventType::MediaTransfer,
            "cleanup" => EventType::Cleanup,
            _ => EventType::ProcessFile,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Persist rows first, transfer media in a follow-up unit
    pub two_phase: bool,
    /// Fail the request on the first row with errors
    pub stop_on_first_error: bool,
    /// Row count, when the uploader knows it
    pub total_rows: Option<u64>,
}

/// Payload of one work unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkJob {
    pub request_id: Uuid,
    pub event_type: EventType,
    pub file_id: Uuid,
    pub file_name: String,
    pub company_id: Uuid,
    pub user_id: Uuid,
    /// Registered name of the row processor
    pub processor: String,
    #[serde(default)]
    pub options: JobOptions,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl BulkJob {
    /// Same request, different event
    pub fn follow_up(&self, event_type: EventType) -> Self {
        Self {
            event_type,
            ..self.clone()
        }
    }
}

/// How a follow-up unit is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleOptions {
    pub delay: Duration,
    pub attempts: u32,
    /// How long the finished unit is kept before purge
    pub retention: Duration,
}

impl ScheduleOptions {
    pub fn cleanup(config: &BulkConfig) -> Self {
        Self {
            delay: Duration::from_secs(config.cleanup_delay_secs),
            attempts: config.cleanup_attempts,
            retention: Duration::from_secs(config.cleanup_retention_secs),
        }
    }

    pub fn immediate(attempts: u32, retention: Duration) -> Self {
        Self {
            delay: Duration::ZERO,
            attempts,
            retention,
        }
    }
}

/// The dispatcher's view of the running work unit
#[async_trait]
pub trait JobHandle: Send + Sync {
    async fn update_progress(&self, percent: u8) -> Result<()>;

    /// Whether the unit was flagged for cancellation
    async fn is_cancel_requested(&self) -> Result<bool>;

    async fn schedule(&self, job: BulkJob, options: ScheduleOptions) -> Result<()>;
}

/// Everything a processor hook sees about the running unit
#[derive(Clone, Copy)]
pub struct JobContext<'a> {
    pub job: &'a BulkJob,
    pub handle: &'a dyn JobHandle,
    pub cancel: &'a CancelSignal,
}

impl<'a> JobContext<'a> {
    pub fn new(job: &'a BulkJob, handle: &'a dyn JobHandle, cancel: &'a CancelSignal) -> Self {
        Self {
            job,
            handle,
            cancel,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.job.request_id
    }
}

impl fmt::Debug for JobContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("request_id", &self.job.request_id)
            .field("event_type", &self.job.event_type)
            .field("cancel", self.cancel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_payload_defaults() {
        let json = serde_json::json!({
            "request_id": Uuid::nil(),
            "event_type": "media-transfer",
            "file_id": Uuid::nil(),
            "file_name": "items.csv",
            "company_id": Uuid::nil(),
            "user_id": Uuid::nil(),
            "processor": "media-catalog"
        });

        let job: BulkJob = serde_json::from_value(json).unwrap();
        assert_eq!(job.event_type, EventType::MediaTransfer);
        assert_eq!(job.options, JobOptions::default());
        assert!(job.metadata.is_empty());

        let cleanup = job.follow_up(EventType::Cleanup);
        assert_eq!(cleanup.request_id, job.request_id);
        assert_eq!(cleanup.event_type, EventType::Cleanup);
    }
}
