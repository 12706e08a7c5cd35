//! Reconciliation engine and the sync pipeline that feeds it.

pub mod executor;
pub mod normalize;
pub mod planner;
pub mod reconcile;
pub mod recorder;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pulse_adapters::{fetcher_for, FetchError, FetchTarget, FetcherKind, HttpClientConfig};
use pulse_core::ExternalRecord;
use pulse_storage::{MemoryStore, PgRecordStore, RecordStore};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use executor::{ExecuteError, ExecutePhase, ExecutionCounts, ReconciliationExecutor};
pub use normalize::normalize;
pub use planner::{
    plan, PlanScope, ReconciliationPlan, RemoveEntry, SkipReason, SkippedRecord, UpdateEntry,
};
pub use reconcile::{PairLocks, ReconcileError, ReconcileSummary, Reconciler};
pub use recorder::{RunOutcome, RunRecorder};

pub const CRATE_NAME: &str = "pulse-sync";

/// Error text on the run row written when an empty fetch is suppressed.
pub const EMPTY_RESPONSE_SUPPRESSED: &str = "empty response suppressed";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

/// One company/source pair the pipeline reconciles.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceEntry {
    pub company_id: Uuid,
    pub company_name: String,
    pub source: String,
    pub fetcher: FetcherKind,
    #[serde(default)]
    pub board: Option<String>,
    /// Relative paths resolve against the workspace root.
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Treat an empty fetch as a source outage and leave existing rows alone. The
    /// skipped cycle is still logged as a `failed` run with zero counts.
    #[serde(default)]
    pub skip_removals_on_empty: bool,
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceEntry> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

impl SourceEntry {
    pub fn target(&self, workspace_root: &Path) -> FetchTarget {
        FetchTarget {
            company_id: self.company_id,
            board: self.board.clone(),
            fixture_path: self
                .fixture_path
                .as_ref()
                .map(|p| if p.is_absolute() { p.clone() } else { workspace_root.join(p) }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            scheduler_enabled: std::env::var("PULSE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("SYNC_CRON_1").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            sync_cron_2: std::env::var("SYNC_CRON_2")
                .unwrap_or_else(|_| "0 0 18 * * *".to_string()),
            user_agent: std::env::var("PULSE_USER_AGENT")
                .unwrap_or_else(|_| "pulse-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("PULSE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            workspace_root: std::env::var("PULSE_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourceOutcome {
    Reconciled { summary: ReconcileSummary },
    SkippedEmpty,
    FetchFailed { error: String },
    ReconcileFailed { error: String },
}

impl SourceOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SourceOutcome::FetchFailed { .. } | SourceOutcome::ReconcileFailed { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub company_id: Uuid,
    pub company_name: String,
    pub source: String,
    pub outcome: SourceOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub reconciled: usize,
    pub failed: usize,
    pub sources: Vec<SourceReport>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpClientConfig,
    reconciler: Reconciler,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn RecordStore>) -> Self {
        Self {
            http: config.http_client_config(),
            reconciler: Reconciler::new(store),
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let registry = SourceRegistry::load(&self.config.registry_path()).await?;
        Ok(self.run_registry(&registry).await)
    }

    /// Reconciles every enabled entry in order. A failing entry is reported and the
    /// rest still run.
    pub async fn run_registry(&self, registry: &SourceRegistry) -> SyncRunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut sources = Vec::new();

        for entry in registry.enabled() {
            let span = info_span!(
                "sync_source",
                %run_id,
                company = %entry.company_name,
                source = %entry.source
            );
            let outcome = self.sync_entry(entry).instrument(span).await;
            sources.push(SourceReport {
                company_id: entry.company_id,
                company_name: entry.company_name.clone(),
                source: entry.source.clone(),
                outcome,
            });
        }

        let failed = sources.iter().filter(|s| s.outcome.is_failure()).count();
        let reconciled = sources
            .iter()
            .filter(|s| matches!(s.outcome, SourceOutcome::Reconciled { .. }))
            .count();
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            enabled_sources: sources.len(),
            reconciled,
            failed,
            sources,
        };
        info!(
            %run_id,
            enabled_sources = summary.enabled_sources,
            reconciled,
            failed,
            "sync run finished"
        );
        summary
    }

    pub async fn sync_entry(&self, entry: &SourceEntry) -> SourceOutcome {
        let started_at = Utc::now();
        let records = match self.fetch_entry(entry).await {
            Ok(records) => records,
            Err(err) => {
                let error = err.to_string();
                warn!(error = %error, "fetch failed");
                if let Err(record_err) = self
                    .reconciler
                    .record_failure(entry.company_id, &entry.source, started_at, error.clone())
                    .await
                {
                    error!(error = %record_err, "could not record failed fetch");
                }
                return SourceOutcome::FetchFailed { error };
            }
        };

        if records.is_empty() && entry.skip_removals_on_empty {
            warn!("source returned no records; skipping cycle to keep existing rows active");
            if let Err(record_err) = self
                .reconciler
                .record_failure(
                    entry.company_id,
                    &entry.source,
                    started_at,
                    EMPTY_RESPONSE_SUPPRESSED,
                )
                .await
            {
                error!(error = %record_err, "could not record suppressed cycle");
            }
            return SourceOutcome::SkippedEmpty;
        }

        match self
            .reconciler
            .reconcile(entry.company_id, &entry.source, records)
            .await
        {
            Ok(summary) => SourceOutcome::Reconciled { summary },
            Err(err) => {
                warn!(error = %err, "reconciliation failed");
                SourceOutcome::ReconcileFailed {
                    error: err.to_string(),
                }
            }
        }
    }

    async fn fetch_entry(&self, entry: &SourceEntry) -> Result<Vec<ExternalRecord>, FetchError> {
        let fetcher = fetcher_for(entry.fetcher, &self.http)?;
        fetcher.fetch(&entry.target(&self.config.workspace_root)).await
    }

    /// Registers `run_once` on both cron expressions. Returns `None` when the
    /// scheduler is disabled; the caller starts the returned scheduler.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_once().await {
                        Ok(summary) => info!(
                            run_id = %summary.run_id,
                            failed = summary.failed,
                            "scheduled sync finished"
                        ),
                        Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

/// Postgres when a database URL is configured, otherwise an in-memory store.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn RecordStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgRecordStore::connect(url)
                .await
                .context("connecting to database")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store, nothing will persist");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let store = open_store(&config).await?;
    SyncPipeline::new(config, store).run_once().await
}
