//! Submeter Background Worker
//!
//! Handles scheduled jobs including:
//! - Expired credit purge (daily at 3:30 AM UTC, batched deletion)
//! - Renewal reminder sweep (hourly)
//! - Data invariant checks (daily at 4:15 AM UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use submeter_billing::BillingService;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Batch size for the expired credit purge
const PURGE_BATCH_SIZE: i64 = 1_000;

/// Horizon for the renewal reminder sweep
const RENEWAL_HORIZON_DAYS: i64 = 7;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
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

    info!("Starting Submeter Worker");

    // Create database pool and apply pending migrations
    let pool = create_db_pool().await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;

    let billing = Arc::new(BillingService::new(pool));

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Purge expired credits (daily at 3:30 AM UTC)
    // Strictly expires_at < now; SKIP LOCKED keeps the batch from contending
    // with in-flight consumption on the same rows.
    let purge_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 30 3 * * *", move |_uuid, _l| {
            let billing = purge_billing.clone();
            Box::pin(async move {
                info!("Running expired credit purge");
                match billing.credits.purge_expired(PURGE_BATCH_SIZE, false).await {
                    Ok(deleted) => info!(deleted = deleted, "Expired credit purge complete"),
                    Err(e) => error!(error = %e, "Expired credit purge failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expired credit purge (daily at 3:30 UTC)");

    // Job 2: Renewal reminder sweep (hourly)
    // Surfaces active, not-yet-renewed subscriptions ending within the
    // horizon so the host application can act on them.
    let renewal_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = renewal_billing.clone();
            Box::pin(async move {
                info!("Running renewal reminder sweep");
                match billing
                    .subscriptions
                    .due_for_renewal(RENEWAL_HORIZON_DAYS, 500)
                    .await
                {
                    Ok(due) => {
                        for subscription in &due {
                            warn!(
                                subscription_id = %subscription.id,
                                subscriber = %subscription.subscriber(),
                                end_at = ?subscription.end_at,
                                "Subscription due for renewal"
                            );
                        }
                        info!(due = due.len(), "Renewal reminder sweep complete");
                    }
                    Err(e) => error!(error = %e, "Renewal reminder sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Renewal reminder sweep (hourly)");

    // Job 3: Invariant checks (daily at 4:15 AM UTC)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 15 4 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match billing.invariants.run_all_checks().await {
                    Ok(summary) => {
                        for violation in &summary.violations {
                            warn!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Invariant violation"
                            );
                        }
                        info!(
                            checks_run = summary.checks_run,
                            checks_failed = summary.checks_failed,
                            healthy = summary.healthy,
                            "Invariant checks complete"
                        );
                    }
                    Err(e) => error!(error = %e, "Invariant checks failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks (daily at 4:15 UTC)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Worker started");

    // Keep the process alive; jobs run on the scheduler's tick.
    loop {
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
}
