use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::{
    ContentFingerprint, NewRecord, NormalizedFields, PersistedRecord, PersistedRecordSummary,
    RecordContent, RemoteType, RunCounts, RunRecord, RunStatus, SeniorityLevel,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use crate::{RecordStore, StoreError};

/// Keeps a multi-row insert well under the Postgres bind-parameter limit.
const INSERT_CHUNK_ROWS: usize = 500;

const RECORD_COLUMNS: &str = "id, company_id, source, external_id, title, location, department, \
     employment_type, job_url, apply_url, published_at, description_html, description_plain, \
     compensation, location_detail, remote_type, seniority_level, content_hash, \
     first_seen_at, last_seen_at, removed_at";

const RUN_COLUMNS: &str = "id, company_id, source, status, found_count, created_count, \
     updated_count, removed_count, skipped_count, started_at, completed_at, error";

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn map_write_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(db.message().to_string())
        }
        other => StoreError::Database(other),
    }
}

fn count_to_db(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn count_from_db(row: &PgRow, column: &'static str) -> Result<usize, StoreError> {
    let value: i64 = row.try_get(column)?;
    usize::try_from(value).map_err(|_| StoreError::Corrupt {
        column,
        value: value.to_string(),
    })
}

fn fingerprint_from_row(row: &PgRow) -> Result<ContentFingerprint, StoreError> {
    let raw: String = row.try_get("content_hash")?;
    ContentFingerprint::from_hex(&raw).ok_or(StoreError::Corrupt {
        column: "content_hash",
        value: raw,
    })
}

fn record_from_row(row: &PgRow) -> Result<PersistedRecord, StoreError> {
    let remote_raw: String = row.try_get("remote_type")?;
    let remote_type = RemoteType::parse(&remote_raw).ok_or(StoreError::Corrupt {
        column: "remote_type",
        value: remote_raw,
    })?;
    let seniority_raw: String = row.try_get("seniority_level")?;
    let seniority_level = SeniorityLevel::parse(&seniority_raw).ok_or(StoreError::Corrupt {
        column: "seniority_level",
        value: seniority_raw,
    })?;

    Ok(PersistedRecord {
        id: row.try_get("id")?,
        company_id: row.try_get("company_id")?,
        source: row.try_get("source")?,
        external_id: row.try_get("external_id")?,
        content: RecordContent {
            title: row.try_get("title")?,
            location: row.try_get("location")?,
            department: row.try_get("department")?,
            employment_type: row.try_get("employment_type")?,
            job_url: row.try_get("job_url")?,
            apply_url: row.try_get("apply_url")?,
            published_at: row.try_get("published_at")?,
            description_html: row.try_get("description_html")?,
            description_plain: row.try_get("description_plain")?,
            compensation: row.try_get("compensation")?,
            location_detail: row.try_get("location_detail")?,
            normalized: NormalizedFields {
                remote_type,
                seniority_level,
            },
            fingerprint: fingerprint_from_row(row)?,
        },
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        removed_at: row.try_get("removed_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<RunRecord, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = RunStatus::parse(&status_raw).ok_or(StoreError::Corrupt {
        column: "status",
        value: status_raw,
    })?;
    Ok(RunRecord {
        id: row.try_get("id")?,
        company_id: row.try_get("company_id")?,
        source: row.try_get("source")?,
        status,
        counts: RunCounts {
            found: count_from_db(row, "found_count")?,
            created: count_from_db(row, "created_count")?,
            updated: count_from_db(row, "updated_count")?,
            removed: count_from_db(row, "removed_count")?,
            skipped: count_from_db(row, "skipped_count")?,
        },
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error: row.try_get("error")?,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn load_summaries(
        &self,
        company_id: Uuid,
        source: &str,
    ) -> Result<Vec<PersistedRecordSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, external_id, content_hash, removed_at
              FROM signal_records
             WHERE company_id = $1 AND source = $2
            "#,
        )
        .bind(company_id)
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<PersistedRecordSummary, StoreError> {
                Ok(PersistedRecordSummary {
                    id: row.try_get("id")?,
                    external_id: row.try_get("external_id")?,
                    fingerprint: fingerprint_from_row(row)?,
                    removed_at: row.try_get("removed_at")?,
                })
            })
            .collect()
    }

    async fn insert_records(&self, records: &[NewRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for chunk in records.chunks(INSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO signal_records (id, company_id, source, external_id, title, location, \
                 department, employment_type, job_url, apply_url, published_at, description_html, \
                 description_plain, compensation, location_detail, remote_type, seniority_level, \
                 content_hash, first_seen_at, last_seen_at) ",
            );
            qb.push_values(chunk, |mut row, record| {
                let content = &record.content;
                row.push_bind(Uuid::new_v4())
                    .push_bind(record.company_id)
                    .push_bind(record.source.clone())
                    .push_bind(record.external_id.clone())
                    .push_bind(content.title.clone())
                    .push_bind(content.location.clone())
                    .push_bind(content.department.clone())
                    .push_bind(content.employment_type.clone())
                    .push_bind(content.job_url.clone())
                    .push_bind(content.apply_url.clone())
                    .push_bind(content.published_at)
                    .push_bind(content.description_html.clone())
                    .push_bind(content.description_plain.clone())
                    .push_bind(content.compensation.clone())
                    .push_bind(content.location_detail.clone())
                    .push_bind(content.normalized.remote_type.as_str())
                    .push_bind(content.normalized.seniority_level.as_str())
                    .push_bind(content.fingerprint.to_hex())
                    .push_bind(record.first_seen_at)
                    .push_bind(record.last_seen_at);
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(map_write_error)?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    async fn update_content(
        &self,
        id: Uuid,
        content: &RecordContent,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE signal_records
               SET title = $2,
                   location = $3,
                   department = $4,
                   employment_type = $5,
                   job_url = $6,
                   apply_url = $7,
                   published_at = $8,
                   description_html = $9,
                   description_plain = $10,
                   compensation = $11,
                   location_detail = $12,
                   remote_type = $13,
                   seniority_level = $14,
                   content_hash = $15,
                   last_seen_at = GREATEST(last_seen_at, $16),
                   removed_at = NULL
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&content.title)
        .bind(&content.location)
        .bind(&content.department)
        .bind(&content.employment_type)
        .bind(&content.job_url)
        .bind(&content.apply_url)
        .bind(content.published_at)
        .bind(&content.description_html)
        .bind(&content.description_plain)
        .bind(&content.compensation)
        .bind(&content.location_detail)
        .bind(content.normalized.remote_type.as_str())
        .bind(content.normalized.seniority_level.as_str())
        .bind(content.fingerprint.to_hex())
        .bind(seen_at)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn touch_record(&self, id: Uuid, seen_at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE signal_records
               SET last_seen_at = GREATEST(last_seen_at, $2),
                   removed_at = NULL
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(seen_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn mark_removed(
        &self,
        ids: &[Uuid],
        removed_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE signal_records
               SET removed_at = $2
             WHERE id = ANY($1) AND removed_at IS NULL
            "#,
        )
        .bind(ids)
        .bind(removed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn append_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reconcile_runs (id, company_id, source, status, found_count, created_count,
                                        updated_count, removed_count, skipped_count, started_at,
                                        completed_at, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(run.id)
        .bind(run.company_id)
        .bind(&run.source)
        .bind(run.status.as_str())
        .bind(count_to_db(run.counts.found))
        .bind(count_to_db(run.counts.created))
        .bind(count_to_db(run.counts.updated))
        .bind(count_to_db(run.counts.removed))
        .bind(count_to_db(run.counts.skipped))
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(&run.error)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;
        Ok(())
    }

    async fn active_records(
        &self,
        company_id: Uuid,
        source: Option<&str>,
    ) -> Result<Vec<PersistedRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM signal_records \
             WHERE company_id = $1 AND removed_at IS NULL \
               AND ($2::TEXT IS NULL OR source = $2) \
             ORDER BY first_seen_at, external_id"
        );
        let rows = sqlx::query(&sql)
            .bind(company_id)
            .bind(source)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM reconcile_runs ORDER BY started_at DESC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(count_to_db(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }
}
