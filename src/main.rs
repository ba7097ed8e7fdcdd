//! Reconciler — one-shot entry point.
//!
//! Loads configuration, initialises structured logging, connects to the
//! store and runs the requested job(s) once: `rate`, `status`, or `all`
//! (the default). Summaries go to stdout, logs to stderr. Exits non-zero
//! if any job hit a fatal error.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use reconciler::config::AppConfig;
use reconciler::engine::detector::ChangeDetector;
use reconciler::engine::notifier::Notifier;
use reconciler::engine::rate_job::RateJob;
use reconciler::engine::status_job::StatusJob;
use reconciler::engine::RunControl;
use reconciler::sources::{HttpFetcher, Source, SourceChainResolver};
use reconciler::storage::sqlite::RunRecord;
use reconciler::storage::SqliteStore;
use reconciler::types::EntityFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    Rate,
    Status,
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Job::Rate => "rate",
            Job::Status => "status",
        }
    }
}

/// What a finished job hands back for printing and the run log.
struct JobResult {
    outcome: &'static str,
    summary: String,
    detail: serde_json::Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    init_logging();
    let cfg = AppConfig::load_or_default()?;

    let jobs = match std::env::args().nth(1).as_deref() {
        None | Some("all") => vec![Job::Rate, Job::Status],
        Some("rate") => vec![Job::Rate],
        Some("status") => vec![Job::Status],
        Some(other) => bail!("Unknown job {other:?}; expected rate, status or all"),
    };

    // Configuration must be complete before any work starts.
    let db_url = cfg.database_url()?;
    let store = Arc::new(
        SqliteStore::connect(&db_url, cfg.database.max_connections)
            .await
            .context("Failed to open store")?,
    );

    let control = RunControl::new();
    {
        let control = control.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current unit of work");
                control.cancel();
            }
        });
    }

    let mut failed = Vec::new();
    for job in jobs {
        if let Err(e) = run_job(job, &cfg, &store, &control).await {
            error!(job = job.name(), error = %e, "Job failed");
            eprintln!("[{}] FAILED: {e:#}", job.name());
            failed.push(job.name());
        }
    }

    if !failed.is_empty() {
        bail!("{} job(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

/// Run one job under the optional single-flight lock and log the run.
async fn run_job(job: Job, cfg: &AppConfig, store: &Arc<SqliteStore>, control: &RunControl) -> Result<()> {
    let run_id = Uuid::new_v4();
    let holder = run_id.to_string();
    let started_at = Utc::now();

    if cfg.run.single_flight {
        let stale = i64::try_from(cfg.run.lock_stale_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .context("run.lock_stale_secs out of range")?;
        if !store.try_acquire_lock(job.name(), &holder, started_at, stale).await? {
            warn!(job = job.name(), "Another run holds the lock, skipping");
            println!("[{}] skipped: another run is in progress", job.name());
            return Ok(());
        }
    }

    let result = match job {
        Job::Rate => run_rate(cfg, store, control).await,
        Job::Status => run_status(cfg, store, control).await,
    };

    if cfg.run.single_flight {
        if let Err(e) = store.release_lock(job.name(), &holder).await {
            warn!(job = job.name(), error = %e, "Failed to release run lock");
        }
    }

    let record = RunRecord {
        run_id,
        job: job.name().to_string(),
        started_at,
        finished_at: Utc::now(),
        outcome: match &result {
            Ok(r) => r.outcome.to_string(),
            Err(_) => "failed".to_string(),
        },
        detail: match &result {
            Ok(r) => r.detail.clone(),
            Err(e) => serde_json::json!({ "error": format!("{e:#}") }),
        },
    };
    if let Err(e) = store.record_run(&record).await {
        warn!(job = job.name(), error = %e, "Failed to record run");
    }

    let result = result?;
    println!("[{}] {}", job.name(), result.summary);
    info!(job = job.name(), run_id = %run_id, outcome = result.outcome, "Job finished");
    Ok(())
}

async fn run_rate(cfg: &AppConfig, store: &Arc<SqliteStore>, control: &RunControl) -> Result<JobResult> {
    let fetcher = Arc::new(HttpFetcher::new(&cfg.http)?);
    let sources = cfg.rate.sources.iter().map(Source::from_config).collect();
    let resolver = SourceChainResolver::new(fetcher, sources, cfg.rate.valid_range.to_range());
    let notifier = Notifier::new(store.clone(), store.clone(), cfg.notify_role());
    let job = RateJob::new(
        &cfg.rate.scope,
        &cfg.rate.unit,
        resolver,
        store.clone(),
        notifier,
        ChangeDetector::new(cfg.rate.tolerance),
    );

    let report = job.run(control).await?;
    for attempt in &report.attempts {
        println!("[rate] source {attempt}");
    }
    Ok(JobResult {
        outcome: if report.changed { "updated" } else { "unchanged" },
        summary: report.to_string(),
        detail: serde_json::to_value(&report).context("Failed to serialise rate report")?,
    })
}

async fn run_status(cfg: &AppConfig, store: &Arc<SqliteStore>, control: &RunControl) -> Result<JobResult> {
    let job = StatusJob::new(store.clone(), EntityFilter::with_role(cfg.entity_role()))
        .with_workers(cfg.status.workers);

    let summary = job.run(control).await?;
    for outcome in &summary.details {
        println!("[status] {outcome}");
    }
    let detail = serde_json::to_value(&summary).context("Failed to serialise run summary")?;
    if summary.aborted {
        bail!("Status sweep aborted: {summary}");
    }
    Ok(JobResult {
        outcome: if summary.errors > 0 { "completed_with_errors" } else { "ok" },
        summary: summary.to_string(),
        detail,
    })
}

/// Initialise the `tracing` subscriber on stderr.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("reconciler=info"));

    let json_logging = std::env::var("RECONCILER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }
}
