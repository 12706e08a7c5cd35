//! Persistence boundary for reconciled records and run audit rows.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::{NewRecord, PersistedRecord, PersistedRecordSummary, RecordContent, RunRecord};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

mod postgres;

pub use postgres::PgRecordStore;

pub const CRATE_NAME: &str = "pulse-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("uniqueness violation: {0}")]
    Conflict(String),
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("corrupt value in column {column}: {value:?}")]
    Corrupt { column: &'static str, value: String },
}

/// Storage operations the reconciler needs. Implementations provide row-level atomicity
/// for each call; `insert_records` is all-or-nothing for the batch.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every row (active and removed) for one company + source.
    async fn load_summaries(
        &self,
        company_id: Uuid,
        source: &str,
    ) -> Result<Vec<PersistedRecordSummary>, StoreError>;

    async fn insert_records(&self, records: &[NewRecord]) -> Result<usize, StoreError>;

    /// Rewrite content, bump `last_seen_at` and clear `removed_at`.
    async fn update_content(
        &self,
        id: Uuid,
        content: &RecordContent,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Bump `last_seen_at` and clear `removed_at`, leaving content alone.
    async fn touch_record(&self, id: Uuid, seen_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Soft-delete currently active rows. Returns how many rows changed.
    async fn mark_removed(
        &self,
        ids: &[Uuid],
        removed_at: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    async fn append_run(&self, run: &RunRecord) -> Result<(), StoreError>;

    async fn active_records(
        &self,
        company_id: Uuid,
        source: Option<&str>,
    ) -> Result<Vec<PersistedRecord>, StoreError>;

    /// Newest first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError>;
}

/// Process-local store with the same semantics as the Postgres one.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<PersistedRecord>,
    runs: Vec<RunRecord>,
}

impl MemoryState {
    fn record_mut(&mut self, id: Uuid) -> Result<&mut PersistedRecord, StoreError> {
        self.records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<PersistedRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn runs(&self) -> Vec<RunRecord> {
        self.state.lock().await.runs.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load_summaries(
        &self,
        company_id: Uuid,
        source: &str,
    ) -> Result<Vec<PersistedRecordSummary>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.company_id == company_id && r.source == source)
            .map(PersistedRecord::summary)
            .collect())
    }

    async fn insert_records(&self, records: &[NewRecord]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;

        let mut keys: HashSet<(Uuid, &str, &str)> = state
            .records
            .iter()
            .map(|r| (r.company_id, r.source.as_str(), r.external_id.as_str()))
            .collect();
        for record in records {
            if !keys.insert((record.company_id, &record.source, &record.external_id)) {
                return Err(StoreError::Conflict(format!(
                    "{}/{}/{}",
                    record.company_id, record.source, record.external_id
                )));
            }
        }
        drop(keys);

        state
            .records
            .extend(records.iter().cloned().map(|record| PersistedRecord {
                id: Uuid::new_v4(),
                company_id: record.company_id,
                source: record.source,
                external_id: record.external_id,
                content: record.content,
                first_seen_at: record.first_seen_at,
                last_seen_at: record.last_seen_at,
                removed_at: None,
            }));
        Ok(records.len())
    }

    async fn update_content(
        &self,
        id: Uuid,
        content: &RecordContent,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state.record_mut(id)?;
        record.content = content.clone();
        record.last_seen_at = record.last_seen_at.max(seen_at);
        record.removed_at = None;
        Ok(())
    }

    async fn touch_record(&self, id: Uuid, seen_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state.record_mut(id)?;
        record.last_seen_at = record.last_seen_at.max(seen_at);
        record.removed_at = None;
        Ok(())
    }

    async fn mark_removed(
        &self,
        ids: &[Uuid],
        removed_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let ids: HashSet<Uuid> = ids.iter().copied().collect();
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for record in state
            .records
            .iter_mut()
            .filter(|r| r.removed_at.is_none() && ids.contains(&r.id))
        {
            record.removed_at = Some(removed_at);
            changed += 1;
        }
        Ok(changed)
    }

    async fn append_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.state.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn active_records(
        &self,
        company_id: Uuid,
        source: Option<&str>,
    ) -> Result<Vec<PersistedRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.company_id == company_id && r.is_active())
            .filter(|r| source.is_none_or(|s| r.source == s))
            .cloned()
            .collect())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut runs = state.runs.clone();
        runs.sort_by_key(|r| std::cmp::Reverse(r.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pulse_core::{
        fingerprint, NormalizedFields, RemoteType, RunCounts, RunStatus, SeniorityLevel,
    };

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn content(text: &str) -> RecordContent {
        RecordContent {
            title: Some("Engineer".into()),
            location: Some("Berlin".into()),
            department: None,
            employment_type: None,
            job_url: None,
            apply_url: None,
            published_at: None,
            description_html: None,
            description_plain: Some(text.into()),
            compensation: None,
            location_detail: None,
            normalized: NormalizedFields {
                remote_type: RemoteType::Onsite,
                seniority_level: SeniorityLevel::Mid,
            },
            fingerprint: fingerprint(Some(text)),
        }
    }

    fn new_record(company_id: Uuid, external_id: &str) -> NewRecord {
        NewRecord {
            company_id,
            source: "ashby".into(),
            external_id: external_id.into(),
            content: content("v1"),
            first_seen_at: ts(8),
            last_seen_at: ts(8),
        }
    }

    #[tokio::test]
    async fn insert_is_all_or_nothing_on_conflict() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        store
            .insert_records(&[new_record(company, "a")])
            .await
            .expect("first insert");

        let err = store
            .insert_records(&[new_record(company, "b"), new_record(company, "a")])
            .await
            .expect_err("duplicate key");
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn same_external_id_under_other_source_is_distinct() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let mut other = new_record(company, "a");
        other.source = "crunchbase".into();
        store
            .insert_records(&[new_record(company, "a"), other])
            .await
            .expect("insert");
        assert_eq!(store.load_summaries(company, "ashby").await.unwrap().len(), 1);
        assert_eq!(store.load_summaries(company, "crunchbase").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_removed_keeps_first_removal_timestamp() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        store.insert_records(&[new_record(company, "a")]).await.unwrap();
        let id = store.records().await[0].id;

        assert_eq!(store.mark_removed(&[id], ts(9)).await.unwrap(), 1);
        assert_eq!(store.mark_removed(&[id], ts(10)).await.unwrap(), 0);
        assert_eq!(store.records().await[0].removed_at, Some(ts(9)));
        assert!(store.active_records(company, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn touch_reactivates_without_rewriting_content() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        store.insert_records(&[new_record(company, "a")]).await.unwrap();
        let id = store.records().await[0].id;
        store.mark_removed(&[id], ts(9)).await.unwrap();

        store.touch_record(id, ts(11)).await.unwrap();
        let record = &store.records().await[0];
        assert_eq!(record.removed_at, None);
        assert_eq!(record.last_seen_at, ts(11));
        assert_eq!(record.first_seen_at, ts(8));
        assert_eq!(record.content, content("v1"));
    }

    #[tokio::test]
    async fn update_content_rewrites_fingerprint() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        store.insert_records(&[new_record(company, "a")]).await.unwrap();
        let id = store.records().await[0].id;

        store.update_content(id, &content("v2"), ts(12)).await.unwrap();
        let summary = &store.load_summaries(company, "ashby").await.unwrap()[0];
        assert_eq!(summary.fingerprint, fingerprint(Some("v2")));

        let missing = store.touch_record(Uuid::new_v4(), ts(12)).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn recent_runs_are_newest_first() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        for hour in [8, 10, 9] {
            store
                .append_run(&RunRecord {
                    id: Uuid::new_v4(),
                    company_id: company,
                    source: "ashby".into(),
                    status: RunStatus::Completed,
                    counts: RunCounts::default(),
                    started_at: ts(hour),
                    completed_at: ts(hour) + Duration::seconds(3),
                    error: None,
                })
                .await
                .unwrap();
        }
        let runs = store.recent_runs(2).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].started_at, ts(10));
        assert_eq!(runs[1].started_at, ts(9));
    }
}
