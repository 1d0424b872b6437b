//! Folio Billing Worker
//!
//! Runs the reconciliation sweep on a cron schedule: subscriptions stuck in
//! `pending_payment`/`incomplete` are confirmed or re-synced from Stripe, and
//! the results are checked against the record invariants.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use folio_billing::{BillingService, InvariantCheckSummary, ReconcileReport, MIGRATOR};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_RECONCILE_CRON: &str = "0 */10 * * * *";
const DEFAULT_RECONCILE_BATCH_SIZE: i64 = 100;
const DEFAULT_RECONCILE_STALE_MINUTES: u64 = 15;

struct WorkerConfig {
    database_url: String,
    reconcile_cron: String,
    batch_size: i64,
    stale_after: Duration,
}

impl WorkerConfig {
    fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let reconcile_cron = std::env::var("RECONCILE_CRON")
            .unwrap_or_else(|_| DEFAULT_RECONCILE_CRON.to_string());
        let batch_size = match std::env::var("RECONCILE_BATCH_SIZE") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("RECONCILE_BATCH_SIZE is not a number: {}", raw))?,
            Err(_) => DEFAULT_RECONCILE_BATCH_SIZE,
        };
        let stale_minutes: u64 = match std::env::var("RECONCILE_STALE_MINUTES") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("RECONCILE_STALE_MINUTES is not a number: {}", raw))?,
            Err(_) => DEFAULT_RECONCILE_STALE_MINUTES,
        };

        Ok(Self {
            database_url,
            reconcile_cron,
            batch_size,
            stale_after: Duration::from_secs(stale_minutes * 60),
        })
    }
}

/// Create a database connection pool
async fn create_db_pool(database_url: &str) -> anyhow::Result<sqlx::PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log results of a reconciliation sweep
fn log_sweep_results(report: &ReconcileReport, summary: &InvariantCheckSummary) {
    info!(
        examined = report.examined,
        reconciled = report.reconciled.len(),
        failed = report.failed.len(),
        invariants_healthy = summary.healthy,
        "Reconciliation cycle complete"
    );

    for failure in &report.failed {
        error!(
            account_id = %failure.account_id,
            subscription_ref = %failure.subscription_ref,
            error = %failure.error,
            "Failed to reconcile subscription"
        );
    }

    for violation in &summary.violations {
        warn!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            account_ids = ?violation.account_ids,
            description = %violation.description,
            "Invariant violation after reconciliation"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Folio billing worker");

    let config = WorkerConfig::from_env()?;
    let pool = create_db_pool(&config.database_url).await?;
    MIGRATOR.run(&pool).await.context("Failed to run migrations")?;
    info!("Migrations applied");

    let cancel = CancellationToken::new();
    let billing = Arc::new(BillingService::from_env(pool, cancel.clone())?);

    let mut scheduler = JobScheduler::new().await?;

    // Sweeps never overlap; a tick that finds one running is skipped
    let sweep_lock = Arc::new(Mutex::new(()));
    let batch_size = config.batch_size;
    let stale_after = config.stale_after;
    let job_billing = billing.clone();
    scheduler
        .add(Job::new_async(
            config.reconcile_cron.as_str(),
            move |_uuid, _l| {
                let billing = job_billing.clone();
                let sweep_lock = sweep_lock.clone();
                Box::pin(async move {
                    let Ok(_guard) = sweep_lock.try_lock() else {
                        warn!("Previous reconciliation sweep still running, skipping");
                        return;
                    };

                    info!("Running scheduled reconciliation sweep");
                    match billing
                        .subscriptions
                        .reconcile_awaiting_settlement(stale_after, batch_size)
                        .await
                    {
                        Ok(report) => {
                            let summary = billing.invariants.run_all_checks(&report.reconciled);
                            log_sweep_results(&report, &summary);
                        }
                        Err(e) => {
                            error!(error = %e, "Reconciliation sweep failed");
                        }
                    }
                })
            },
        )?)
        .await?;
    info!(cron = %config.reconcile_cron, "Scheduled: reconciliation sweep");

    info!("Starting job scheduler");
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Ends in-flight retry waits so the current sweep winds down quickly
    cancel.cancel();
    scheduler.shutdown().await?;

    info!("Folio billing worker stopped");
    Ok(())
}
