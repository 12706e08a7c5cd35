use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pulse_adapters::load_fixture_records;
use pulse_core::ActiveDistribution;
use pulse_storage::PgRecordStore;
use pulse_sync::{open_store, Reconciler, SourceOutcome, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "pulse")]
#[command(about = "Reconcile company job sources into a persistent store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile every enabled entry in sources.yaml once.
    Sync,
    /// Reconcile one company/source from a JSON file of external records.
    Reconcile {
        #[arg(long)]
        company: Uuid,
        #[arg(long)]
        source: String,
        #[arg(long)]
        fixture: PathBuf,
    },
    /// Show the most recent reconciliation runs.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Active record counts by remote type and seniority.
    Active {
        #[arg(long)]
        company: Uuid,
        #[arg(long)]
        source: Option<String>,
    },
    Migrate,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pulse=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let store = open_store(&config).await?;
            let summary = SyncPipeline::new(config, store).run_once().await?;
            for report in &summary.sources {
                match &report.outcome {
                    SourceOutcome::Reconciled { summary } => println!(
                        "{} / {}: found={} created={} updated={} removed={} skipped={}",
                        report.company_name,
                        report.source,
                        summary.found,
                        summary.created,
                        summary.updated,
                        summary.removed,
                        summary.skipped
                    ),
                    SourceOutcome::SkippedEmpty => println!(
                        "{} / {}: empty response, skipped",
                        report.company_name, report.source
                    ),
                    SourceOutcome::FetchFailed { error }
                    | SourceOutcome::ReconcileFailed { error } => println!(
                        "{} / {}: failed: {error}",
                        report.company_name, report.source
                    ),
                }
            }
            println!(
                "sync complete: run_id={} sources={} reconciled={} failed={}",
                summary.run_id, summary.enabled_sources, summary.reconciled, summary.failed
            );
        }
        Commands::Reconcile {
            company,
            source,
            fixture,
        } => {
            let store = open_store(&config).await?;
            let records = load_fixture_records(&fixture)
                .await
                .with_context(|| format!("loading {}", fixture.display()))?;
            let summary = Reconciler::new(store).reconcile(company, &source, records).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Runs { limit } => {
            let store = open_store(&config).await?;
            for run in store.recent_runs(limit).await? {
                println!(
                    "{} {} {}/{} {} found={} created={} updated={} removed={} skipped={}{}",
                    run.started_at.to_rfc3339(),
                    run.id,
                    run.company_id,
                    run.source,
                    run.status.as_str(),
                    run.counts.found,
                    run.counts.created,
                    run.counts.updated,
                    run.counts.removed,
                    run.counts.skipped,
                    run.error.map(|e| format!(" error={e}")).unwrap_or_default()
                );
            }
        }
        Commands::Active { company, source } => {
            let store = open_store(&config).await?;
            let records = store.active_records(company, source.as_deref()).await?;
            let distribution = ActiveDistribution::from_records(&records);
            println!("{}", serde_json::to_string_pretty(&distribution)?);
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgRecordStore::connect(url).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Schedule => {
            let store = open_store(&config).await?;
            let pipeline = Arc::new(SyncPipeline::new(config, store));
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set PULSE_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
