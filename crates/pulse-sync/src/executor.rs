//! Applies a reconciliation plan against a [`RecordStore`].

use std::fmt;
use std::sync::Arc;

use pulse_storage::{RecordStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn, Span};
use uuid::Uuid;

use crate::planner::ReconciliationPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExecutionCounts {
    pub created: usize,
    /// Rows whose content changed; presence-only refreshes are not counted.
    pub updated: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutePhase {
    Create,
    Update,
    Remove,
}

impl fmt::Display for ExecutePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutePhase::Create => "create",
            ExecutePhase::Update => "update",
            ExecutePhase::Remove => "remove",
        })
    }
}

/// A write failed. `completed` holds what was applied before the failing call.
#[derive(Debug, Error)]
#[error("{phase} phase failed: {source}")]
pub struct ExecuteError {
    pub phase: ExecutePhase,
    pub completed: ExecutionCounts,
    #[source]
    pub source: StoreError,
}

pub struct ReconciliationExecutor {
    store: Arc<dyn RecordStore>,
    span: Span,
}

impl ReconciliationExecutor {
    pub fn new(store: Arc<dyn RecordStore>, span: Span) -> Self {
        Self { store, span }
    }

    /// Creates as one batch, updates row by row, removals as one batch.
    pub async fn execute(
        &self,
        plan: &ReconciliationPlan,
    ) -> Result<ExecutionCounts, ExecuteError> {
        let mut counts = ExecutionCounts::default();
        let fail = |phase, completed, source| ExecuteError {
            phase,
            completed,
            source,
        };

        if !plan.to_create.is_empty() {
            self.store
                .insert_records(&plan.to_create)
                .await
                .map_err(|err| fail(ExecutePhase::Create, counts, err))?;
            counts.created = plan.to_create.len();
            info!(
                parent: &self.span,
                company_id = %plan.company_id,
                source = %plan.source,
                created = counts.created,
                "inserted new records"
            );
        }

        let mut refreshed = 0usize;
        for entry in &plan.to_update {
            let written = if entry.changed {
                self.store
                    .update_content(entry.id, &entry.content, entry.last_seen_at)
                    .await
            } else {
                self.store.touch_record(entry.id, entry.last_seen_at).await
            };
            written.map_err(|err| fail(ExecutePhase::Update, counts, err))?;

            if entry.changed {
                counts.updated += 1;
            } else {
                refreshed += 1;
            }
            if entry.reactivated {
                debug!(
                    parent: &self.span,
                    record_id = %entry.id,
                    external_id = %entry.external_id,
                    "record reappeared"
                );
            }
        }
        if !plan.to_update.is_empty() {
            info!(
                parent: &self.span,
                company_id = %plan.company_id,
                source = %plan.source,
                updated = counts.updated,
                refreshed,
                "applied updates"
            );
        }

        if !plan.to_remove.is_empty() {
            let ids: Vec<Uuid> = plan.to_remove.iter().map(|r| r.id).collect();
            let removed_at = plan.to_remove[0].removed_at;
            let affected = self
                .store
                .mark_removed(&ids, removed_at)
                .await
                .map_err(|err| fail(ExecutePhase::Remove, counts, err))?;
            counts.removed = plan.to_remove.len();
            if affected != counts.removed {
                warn!(
                    parent: &self.span,
                    company_id = %plan.company_id,
                    source = %plan.source,
                    planned = counts.removed,
                    affected,
                    "soft-delete touched fewer rows than planned"
                );
            }
            info!(
                parent: &self.span,
                company_id = %plan.company_id,
                source = %plan.source,
                removed = counts.removed,
                "soft-deleted records"
            );
        }

        Ok(counts)
    }
}
