//! Appends the audit row for each reconciliation cycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pulse_core::{RunCounts, RunRecord, RunStatus};
use pulse_storage::{RecordStore, StoreError};
use tracing::{info, warn, Span};
use uuid::Uuid;

/// Final state of one cycle, as handed to [`RunRecorder::record`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub counts: RunCounts,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn completed(counts: RunCounts) -> Self {
        Self {
            status: RunStatus::Completed,
            counts,
            error: None,
        }
    }

    pub fn failed(counts: RunCounts, error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            counts,
            error: Some(error.into()),
        }
    }
}

/// Appends one audit row per reconciliation cycle.
pub struct RunRecorder {
    store: Arc<dyn RecordStore>,
    span: Span,
}

impl RunRecorder {
    pub fn new(store: Arc<dyn RecordStore>, span: Span) -> Self {
        Self { store, span }
    }

    pub async fn record(
        &self,
        company_id: Uuid,
        source: &str,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        outcome: RunOutcome,
    ) -> Result<RunRecord, StoreError> {
        let run = RunRecord {
            id: Uuid::new_v4(),
            company_id,
            source: source.to_string(),
            status: outcome.status,
            counts: outcome.counts,
            started_at,
            completed_at,
            error: outcome.error,
        };
        self.store.append_run(&run).await?;

        let elapsed_ms = (completed_at - started_at).num_milliseconds();
        match run.status {
            RunStatus::Completed => info!(
                parent: &self.span,
                run_id = %run.id,
                %company_id,
                source,
                found = run.counts.found,
                created = run.counts.created,
                updated = run.counts.updated,
                removed = run.counts.removed,
                skipped = run.counts.skipped,
                elapsed_ms,
                "reconciliation completed"
            ),
            RunStatus::Failed => warn!(
                parent: &self.span,
                run_id = %run.id,
                %company_id,
                source,
                found = run.counts.found,
                created = run.counts.created,
                updated = run.counts.updated,
                removed = run.counts.removed,
                error = run.error.as_deref().unwrap_or_default(),
                elapsed_ms,
                "reconciliation failed"
            ),
        }
        Ok(run)
    }
}
