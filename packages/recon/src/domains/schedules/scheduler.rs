//! Evaluates due schedules and turns each firing into exactly one job.
//!
//! Any number of evaluators may run against the same database. A firing is
//! claimed with a conditional update on the `next_run` the evaluator saw,
//! so when two evaluators race on the same schedule only one of them
//! creates a job and the other sees zero rows and moves on.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::common::StoreResult;
use crate::kernel::jobs::Job;
use crate::kernel::persistence::PersistenceGateway;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Six-field cron for the evaluation tick.
    pub tick_cron: String,
    /// Maximum schedules fired per tick.
    pub batch_limit: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_cron: "*/15 * * * * *".to_string(),
            batch_limit: 100,
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    gateway: PersistenceGateway,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(gateway: PersistenceGateway, config: SchedulerConfig) -> Self {
        Self { gateway, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Fires every enabled schedule whose `next_run` is at or before `now`.
    ///
    /// Returns the jobs this evaluator created. A schedule that fails to
    /// fire is logged and skipped; it stays due and is retried next tick.
    pub async fn evaluate_once(&self, now: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        let due = self
            .gateway
            .due_schedules(now, self.config.batch_limit)
            .await?;
        if due.is_empty() {
            debug!("no schedules due");
            return Ok(Vec::new());
        }

        let mut created = Vec::new();
        for schedule in &due {
            match self.gateway.fire_schedule(schedule, now).await {
                Ok(Some(job)) => {
                    info!(
                        schedule_id = %schedule.id,
                        schedule = %schedule.name,
                        job = %job.job_ref(),
                        "schedule fired"
                    );
                    created.push(job);
                }
                Ok(None) => {
                    debug!(schedule_id = %schedule.id, "no job: firing claimed elsewhere or no hosts matched");
                }
                Err(e) => {
                    warn!(schedule_id = %schedule.id, error = %e, "failed to fire schedule");
                }
            }
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::schedules::cron_expr::CronExpression;

    #[test]
    fn default_tick_is_a_valid_cron() {
        let config = SchedulerConfig::default();
        assert!(CronExpression::parse(&config.tick_cron).is_ok());
        assert_eq!(config.batch_limit, 100);
    }
}
