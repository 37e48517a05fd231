//! Scheduled background tasks using tokio-cron-scheduler.
//!
//! One task: the schedule evaluation tick. It only decides which schedules
//! are due and hands their jobs to the orchestrator; execution happens in
//! the worker pool.
//!
//! ```text
//! Scheduler (tick cron, default every 15s)
//!     │
//!     └─► Orchestrator::evaluate_schedules_once()
//!             ├─► claim firing + create job (one transaction per schedule)
//!             └─► start_job → worker pool
//! ```

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};

use super::orchestrator::Orchestrator;
use crate::domains::schedules::CronExpression;

/// Start all scheduled tasks
pub async fn start_scheduler(orchestrator: Arc<Orchestrator>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;
    let tick_cron = CronExpression::parse(&orchestrator.scheduler().config().tick_cron)
        .context("invalid scheduler tick cron")?
        .with_seconds()
        .to_string();

    let tick_orchestrator = orchestrator.clone();
    let tick = Job::new_async(tick_cron.as_str(), move |_uuid, _lock| {
        let orchestrator = tick_orchestrator.clone();
        Box::pin(async move {
            match orchestrator.evaluate_schedules_once().await {
                Ok(jobs) if !jobs.is_empty() => {
                    tracing::info!(created = jobs.len(), "schedule tick created jobs");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "schedule evaluation failed"),
            }
        })
    })
    .with_context(|| format!("invalid scheduler tick cron '{}'", tick_cron))?;

    scheduler.add(tick).await?;
    scheduler.start().await?;

    tracing::info!(tick = %tick_cron, "Scheduled tasks started (schedule evaluation)");
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn five_field_tick_is_accepted_by_the_job_scheduler() {
        let tick = CronExpression::parse("*/5 * * * *").unwrap();
        let job = Job::new_async(tick.with_seconds(), |_uuid, _lock| Box::pin(async {}));
        assert!(job.is_ok());
    }
}
