//! Recon daemon
//!
//! Runs the worker pool and the schedule tick against the configured
//! database until Ctrl-C, then drains in-flight jobs within the shutdown
//! grace period.

use std::sync::Arc;

use anyhow::{Context, Result};
use recon_core::kernel::jobs::WorkerPool;
use recon_core::kernel::{
    start_scheduler, Orchestrator, RetryPolicy, ServerKernel, TcpConnectProbe,
    TracingNotificationSink,
};
use recon_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,recon_core=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(
        worker_id = %config.worker.worker_id,
        pool_size = config.worker.pool_size,
        "Starting recond"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations applied");

    let probe = Arc::new(TcpConnectProbe::new(config.probe.clone()));
    // No in-process subscribers here; job events go to the log.
    let notifications = Arc::new(TracingNotificationSink);
    let kernel = Arc::new(ServerKernel::new(
        pool.clone(),
        RetryPolicy::new(config.retry.clone()),
        probe.clone(),
        probe,
        notifications,
    ));

    let workers = WorkerPool::new(kernel.clone(), config.worker.clone());
    workers.start();

    let orchestrator = Arc::new(Orchestrator::new(
        kernel,
        workers.clone(),
        config.scheduler.clone(),
    ));
    let mut scheduler = start_scheduler(orchestrator)
        .await
        .context("Failed to start scheduler")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = %e, "Scheduler did not shut down cleanly");
    }
    let report = workers.shutdown().await;
    tracing::info!(
        drained = report.drained,
        interrupted = report.interrupted.len(),
        abandoned = report.abandoned.len(),
        "Worker pool stopped"
    );

    pool.close().await;
    Ok(())
}
