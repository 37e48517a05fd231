use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::domains::schedules::{CronExpression, SchedulerConfig};
use crate::kernel::jobs::WorkerPoolConfig;
use crate::kernel::retry::RetryConfig;
use crate::kernel::tcp_probe::TcpProbeConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub worker: WorkerPoolConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub probe: TcpProbeConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL must be set")?;

        let worker_defaults = WorkerPoolConfig::default();
        let worker = WorkerPoolConfig {
            pool_size: var_or(&lookup, "WORKER_POOL_SIZE", worker_defaults.pool_size)?,
            queue_capacity: var_or(&lookup, "WORKER_QUEUE_CAPACITY", worker_defaults.queue_capacity)?,
            poll_pending: var_or(&lookup, "WORKER_POLL_PENDING", worker_defaults.poll_pending)?,
            min_poll_interval: millis_or(&lookup, "WORKER_MIN_POLL_MS", worker_defaults.min_poll_interval)?,
            max_poll_interval: millis_or(&lookup, "WORKER_MAX_POLL_MS", worker_defaults.max_poll_interval)?,
            job_timeout: secs_or(&lookup, "JOB_TIMEOUT_SECS", worker_defaults.job_timeout)?,
            shutdown_grace: secs_or(&lookup, "SHUTDOWN_GRACE_SECS", worker_defaults.shutdown_grace)?,
            heartbeat_interval: secs_or(
                &lookup,
                "HEARTBEAT_INTERVAL_SECS",
                worker_defaults.heartbeat_interval,
            )?,
            stale_after: secs_or(&lookup, "STALE_JOB_AFTER_SECS", worker_defaults.stale_after)?,
            worker_id: lookup("WORKER_ID").unwrap_or(worker_defaults.worker_id),
        };
        if worker.pool_size == 0 {
            anyhow::bail!("WORKER_POOL_SIZE must be at least 1");
        }
        if worker.stale_after <= worker.heartbeat_interval {
            anyhow::bail!("STALE_JOB_AFTER_SECS must exceed HEARTBEAT_INTERVAL_SECS");
        }

        let retry_defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_attempts: var_or(&lookup, "RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
            base_delay_ms: var_or(&lookup, "RETRY_BASE_DELAY_MS", retry_defaults.base_delay_ms)?,
            max_delay_ms: var_or(&lookup, "RETRY_MAX_DELAY_MS", retry_defaults.max_delay_ms)?,
            jitter_ratio: var_or(&lookup, "RETRY_JITTER_RATIO", retry_defaults.jitter_ratio)?,
        };
        if !(0.0..=1.0).contains(&retry.jitter_ratio) {
            anyhow::bail!("RETRY_JITTER_RATIO must be between 0 and 1");
        }

        let scheduler_defaults = SchedulerConfig::default();
        let tick_cron = lookup("SCHEDULER_TICK_CRON").unwrap_or(scheduler_defaults.tick_cron);
        let tick_cron = CronExpression::parse(&tick_cron)
            .context("SCHEDULER_TICK_CRON must be a valid cron expression")?
            .with_seconds()
            .to_string();
        let scheduler = SchedulerConfig {
            tick_cron,
            batch_limit: var_or(&lookup, "SCHEDULER_BATCH_LIMIT", scheduler_defaults.batch_limit)?,
        };

        let probe_defaults = TcpProbeConfig::default();
        let probe = TcpProbeConfig {
            connect_timeout: millis_or(&lookup, "PROBE_CONNECT_TIMEOUT_MS", probe_defaults.connect_timeout)?,
            concurrency: var_or(&lookup, "PROBE_CONCURRENCY", probe_defaults.concurrency)?,
            liveness_ports: probe_defaults.liveness_ports,
        };

        Ok(Self {
            database_url,
            database_max_connections: var_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            worker,
            retry,
            scheduler,
            probe,
        })
    }
}

fn var_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", key, raw)),
        None => Ok(default),
    }
}

fn secs_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    var_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

fn millis_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    var_or(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/recon")])).unwrap();
        assert_eq!(config.database_max_connections, 10);
        assert_eq!(config.worker.pool_size, 4);
        assert_eq!(config.worker.shutdown_grace, Duration::from_secs(30));
        assert_eq!(config.worker.min_poll_interval, Duration::from_millis(250));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.scheduler.tick_cron, "*/15 * * * * *");
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/recon"),
            ("WORKER_POOL_SIZE", "16"),
            ("WORKER_POLL_PENDING", "false"),
            ("SHUTDOWN_GRACE_SECS", "2"),
            ("RETRY_JITTER_RATIO", "0.5"),
            ("WORKER_ID", "recond-1"),
        ]))
        .unwrap();
        assert_eq!(config.worker.pool_size, 16);
        assert!(!config.worker.poll_pending);
        assert_eq!(config.worker.shutdown_grace, Duration::from_secs(2));
        assert_eq!(config.retry.jitter_ratio, 0.5);
        assert_eq!(config.worker.worker_id, "recond-1");
    }

    #[test]
    fn test_five_field_tick_cron_gets_seconds() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/recon"),
            ("SCHEDULER_TICK_CRON", "*/5 * * * *"),
        ]))
        .unwrap();
        assert_eq!(config.scheduler.tick_cron, "0 */5 * * * *");
    }

    #[test]
    fn test_missing_database_url() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let base = ("DATABASE_URL", "postgres://db/recon");
        assert!(Config::from_lookup(lookup(&[base, ("WORKER_POOL_SIZE", "many")])).is_err());
        assert!(Config::from_lookup(lookup(&[base, ("WORKER_POOL_SIZE", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[base, ("RETRY_JITTER_RATIO", "2")])).is_err());
        assert!(Config::from_lookup(lookup(&[base, ("SCHEDULER_TICK_CRON", "nope")])).is_err());
        assert!(Config::from_lookup(lookup(&[
            base,
            ("HEARTBEAT_INTERVAL_SECS", "60"),
            ("STALE_JOB_AFTER_SECS", "30"),
        ]))
        .is_err());
    }
}
