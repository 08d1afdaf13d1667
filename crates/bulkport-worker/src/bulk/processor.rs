//! Row processor contract
//!
//! A processor turns spreadsheet rows into domain entities. The
//! orchestrator stays workload-agnostic: it streams rows, keeps counters and
//! logs, and owns every status transition. What a processor may take over is
//! declared through [`Capabilities`]:
//!
//! - completion and error handling are [`Delegated`]: claiming one means
//!   handing the orchestrator a reference to the hook that implements it, so
//!   a claim without a hook cannot be expressed
//! - progress reporting and file-status restoration are plain [`Ownership`]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::jobs::{BulkJob, JobContext};
use super::two_phase::MediaPhaseHook;
use super::types::RowCounters;
use super::Result;

/// One spreadsheet row keyed by normalized header
pub type Row = BTreeMap<String, String>;

/// Validation and side-effect result for one row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowOutcome {
    pub entity_id: Option<String>,
    pub entity_type: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl RowOutcome {
    pub fn success(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            entity_type: entity_type.into(),
            ..Self::default()
        }
    }

    pub fn failure(entity_type: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            errors,
            ..Self::default()
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Rows with warnings but no errors still succeed
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Who drives a concern that needs no hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ownership {
    #[default]
    Orchestrator,
    Processor,
}

/// A concern handled by the orchestrator's defaults or by a processor hook
pub enum Delegated<'a, H: ?Sized> {
    Orchestrator,
    Processor(&'a H),
}

impl<H: ?Sized> Delegated<'_, H> {
    pub fn is_delegated(&self) -> bool {
        matches!(self, Delegated::Processor(_))
    }
}

impl<H: ?Sized> Clone for Delegated<'_, H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: ?Sized> Copy for Delegated<'_, H> {}

impl<H: ?Sized> Default for Delegated<'_, H> {
    fn default() -> Self {
        Delegated::Orchestrator
    }
}

/// What a processor takes over from the orchestrator
#[derive(Clone, Copy, Default)]
pub struct Capabilities<'a> {
    pub completion: Delegated<'a, dyn CompletionHook + 'a>,
    pub error_states: Delegated<'a, dyn ErrorStateHook + 'a>,
    pub progress: Ownership,
    pub file_status: Ownership,
}

impl Capabilities<'_> {
    pub fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            handles_completion: self.completion.is_delegated(),
            handles_error_states: self.error_states.is_delegated(),
            handles_progress_updates: self.progress == Ownership::Processor,
            handles_file_status_restoration: self.file_status == Ownership::Processor,
        }
    }
}

/// Flat view of [`Capabilities`] for logs and status output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub handles_completion: bool,
    pub handles_error_states: bool,
    pub handles_progress_updates: bool,
    pub handles_file_status_restoration: bool,
}

/// What the orchestrator does after a completion hook returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionDirective {
    /// Apply the default finalization now
    Finalize,
    /// The processor scheduled more work; leave the request PROCESSING
    Deferred,
}

#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_processing_complete(
        &self,
        ctx: &JobContext<'_>,
        counters: &RowCounters,
    ) -> Result<CompletionDirective>;
}

/// Cleanup run before the orchestrator records FAILED or CANCELLED
#[async_trait]
pub trait ErrorStateHook: Send + Sync {
    async fn on_processing_failed(&self, ctx: &JobContext<'_>, error: &str) -> Result<()>;

    async fn on_processing_cancelled(&self, ctx: &JobContext<'_>) -> Result<()>;
}

/// Workload-specific row handling
#[async_trait]
pub trait RowProcessor: Send + Sync {
    /// Registry name, matched against [`BulkJob::processor`]
    fn name(&self) -> &'static str;

    /// Entity type recorded on row logs
    fn entity_type(&self) -> &'static str;

    /// Blank row: every known column with its default
    fn create_row(&self) -> Row;

    async fn process_row(&self, row: Row, row_number: u64, ctx: &JobContext<'_>) -> Result<RowOutcome>;

    async fn on_start(&self, _ctx: &JobContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called after every flush of counters and logs
    async fn on_batch_update(&self, _ctx: &JobContext<'_>, _counters: &RowCounters) -> Result<()> {
        Ok(())
    }

    /// Called once the whole sheet was read
    async fn on_complete(&self, _ctx: &JobContext<'_>, _counters: &RowCounters) -> Result<()> {
        Ok(())
    }

    fn capabilities(&self, _job: &BulkJob) -> Capabilities<'_> {
        Capabilities::default()
    }

    /// Second phase of two-phase requests
    fn media_phase(&self) -> Option<&dyn MediaPhaseHook> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Hooks;

    #[async_trait]
    impl CompletionHook for Hooks {
        async fn on_processing_complete(
            &self,
            _ctx: &JobContext<'_>,
            _counters: &RowCounters,
        ) -> Result<CompletionDirective> {
            Ok(CompletionDirective::Finalize)
        }
    }

    #[test]
    fn test_descriptor_reflects_claims() {
        assert_eq!(
            Capabilities::default().descriptor(),
            CapabilityDescriptor::default()
        );

        let hooks = Hooks;
        let caps = Capabilities {
            completion: Delegated::Processor(&hooks),
            progress: Ownership::Processor,
            ..Capabilities::default()
        };
        let descriptor = caps.descriptor();
        assert!(descriptor.handles_completion);
        assert!(!descriptor.handles_error_states);
        assert!(descriptor.handles_progress_updates);
        assert!(!descriptor.handles_file_status_restoration);
    }

    #[test]
    fn test_warnings_do_not_fail_a_row() {
        let outcome = RowOutcome::success("item", "1").with_warning("media skipped");
        assert!(outcome.is_success());
        assert!(!RowOutcome::failure("item", vec!["sku is required".into()]).is_success());
    }
}
