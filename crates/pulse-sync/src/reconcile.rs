//! Single entry point for one reconciliation cycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use pulse_core::{ExternalRecord, RunCounts, RunRecord};
use pulse_storage::{RecordStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info_span, warn, Span};
use uuid::Uuid;

use crate::executor::{ExecuteError, ReconciliationExecutor};
use crate::planner::{self, PlanScope};
use crate::recorder::{RunOutcome, RunRecorder};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("loading existing records: {0}")]
    Load(#[source] StoreError),
    #[error(transparent)]
    Execute(#[from] ExecuteError),
    #[error("recording run: {0}")]
    Record(#[source] StoreError),
}

/// Result of a completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub run_id: Uuid,
    pub found: usize,
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub skipped: usize,
}

impl ReconcileSummary {
    fn new(run_id: Uuid, counts: RunCounts) -> Self {
        Self {
            run_id,
            found: counts.found,
            created: counts.created,
            updated: counts.updated,
            removed: counts.removed,
            skipped: counts.skipped,
        }
    }
}

type PairKey = (Uuid, String);

/// One async lock per (company, source), so cycles on the same pair never overlap.
/// An entry lives only while some caller holds or waits on it.
#[derive(Debug, Default)]
pub struct PairLocks {
    pairs: StdMutex<HashMap<PairKey, Arc<Mutex<()>>>>,
}

impl PairLocks {
    pub async fn acquire(&self, company_id: Uuid, source: &str) -> PairGuard<'_> {
        let key = (company_id, source.to_string());
        let lock = self
            .pairs()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        PairGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    /// Pairs currently held or awaited.
    pub fn tracked_pairs(&self) -> usize {
        self.pairs().len()
    }

    fn pairs(&self) -> MutexGuard<'_, HashMap<PairKey, Arc<Mutex<()>>>> {
        self.pairs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held for the length of a cycle. Dropping it releases the pair and forgets
/// the entry when nobody else is queued on it.
#[derive(Debug)]
pub struct PairGuard<'a> {
    locks: &'a PairLocks,
    key: PairKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PairGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut pairs = self.locks.pairs();
        if pairs
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            pairs.remove(&self.key);
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    executor: ReconciliationExecutor,
    recorder: RunRecorder,
    locks: PairLocks,
    span: Span,
}

impl Reconciler {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::with_span(store, info_span!("reconcile"))
    }

    /// `span` becomes the parent of every event the executor and recorder emit.
    pub fn with_span(store: Arc<dyn RecordStore>, span: Span) -> Self {
        Self {
            executor: ReconciliationExecutor::new(store.clone(), span.clone()),
            recorder: RunRecorder::new(store.clone(), span.clone()),
            store,
            locks: PairLocks::default(),
            span,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn locks(&self) -> &PairLocks {
        &self.locks
    }

    /// Runs plan + execute for one company/source and writes exactly one run row,
    /// whether the cycle succeeds or not.
    pub async fn reconcile(
        &self,
        company_id: Uuid,
        source: &str,
        incoming: Vec<ExternalRecord>,
    ) -> Result<ReconcileSummary, ReconcileError> {
        let _pair = self.locks.acquire(company_id, source).await;

        let started_at = Utc::now();
        let mut counts = RunCounts {
            found: incoming.len(),
            ..RunCounts::default()
        };
        let result = self
            .run_cycle(company_id, source, incoming, started_at, &mut counts)
            .await;

        let outcome = match &result {
            Ok(()) => RunOutcome::completed(counts),
            Err(err) => RunOutcome::failed(counts, err.to_string()),
        };
        let recorded = self
            .recorder
            .record(company_id, source, started_at, Utc::now(), outcome)
            .await;

        match (result, recorded) {
            (Ok(()), Ok(run)) => Ok(ReconcileSummary::new(run.id, counts)),
            (Ok(()), Err(err)) => Err(ReconcileError::Record(err)),
            (Err(err), Ok(_)) => Err(err),
            (Err(err), Err(record_err)) => {
                error!(
                    parent: &self.span,
                    %company_id,
                    source,
                    error = %record_err,
                    "could not record failed run"
                );
                Err(err)
            }
        }
    }

    /// Writes a failed run row for a cycle that never reached planning, e.g. a fetch error.
    pub async fn record_failure(
        &self,
        company_id: Uuid,
        source: &str,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Result<RunRecord, StoreError> {
        let _pair = self.locks.acquire(company_id, source).await;
        self.recorder
            .record(
                company_id,
                source,
                started_at,
                Utc::now(),
                RunOutcome::failed(RunCounts::default(), error),
            )
            .await
    }

    async fn run_cycle(
        &self,
        company_id: Uuid,
        source: &str,
        incoming: Vec<ExternalRecord>,
        now: DateTime<Utc>,
        counts: &mut RunCounts,
    ) -> Result<(), ReconcileError> {
        let existing = self
            .store
            .load_summaries(company_id, source)
            .await
            .map_err(ReconcileError::Load)?;

        let scope = PlanScope {
            company_id,
            source: source.to_string(),
            now,
        };
        let plan = planner::plan(&existing, incoming, &scope);

        counts.skipped = plan.skipped.len();
        if !plan.skipped.is_empty() {
            warn!(
                parent: &self.span,
                %company_id,
                source,
                skipped = plan.skipped.len(),
                "skipped malformed incoming records"
            );
        }

        match self.executor.execute(&plan).await {
            Ok(applied) => {
                counts.created = applied.created;
                counts.updated = applied.updated;
                counts.removed = applied.removed;
                Ok(())
            }
            Err(err) => {
                counts.created = err.completed.created;
                counts.updated = err.completed.updated;
                counts.removed = err.completed.removed;
                Err(err.into())
            }
        }
    }
}
