//! Paysync Background Worker
//!
//! Handles scheduled maintenance over the webhook ledger:
//! - Reaping stuck `processing` claims (every minute)
//! - Resubmitting retryable failed events (every 5 minutes)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use paysync_ingest::IngestService;
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// How many failed records one retry sweep will resubmit.
const RETRY_BATCH_SIZE: i64 = 50;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

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

    info!("Starting Paysync Worker");

    let pool = create_db_pool().await?;

    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("Migrations applied");

    let service = Arc::new(IngestService::from_env(pool).await?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Reap stuck processing claims (every minute)
    // A worker that died mid-reconciliation leaves its claim behind; the
    // reaper returns those records to the retry pool.
    let reaper_service = service.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let service = reaper_service.clone();
            Box::pin(async move {
                match service.replay.reclaim_stuck().await {
                    Ok(0) => {}
                    Ok(reclaimed) => {
                        info!(reclaimed, "Reaper returned stuck events to the retry pool")
                    }
                    Err(e) => error!(error = %e, "Reaper sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stuck claim reaper (every minute)");

    // Job 2: Resubmit retryable failures (every 5 minutes)
    let retry_service = service.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let service = retry_service.clone();
            Box::pin(async move {
                match service.replay.retry_failed(RETRY_BATCH_SIZE).await {
                    Ok(summary) if summary.attempted > 0 => info!(
                        attempted = summary.attempted,
                        processed = summary.processed,
                        failed = summary.failed,
                        skipped = summary.skipped,
                        "Retry sweep complete"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Retry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Failed event retry (every 5 minutes)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Worker started, all jobs scheduled");

    // Park the main task; jobs run on the scheduler.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
