use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use typed_builder::TypedBuilder;

use crate::common::{ScheduleId, StoreResult, ValidationError};
use crate::domains::discovery::models::NewDiscoveryJob;
use crate::domains::hosts::models::HostFilter;
use crate::domains::scans::models::NewScanJob;
use crate::domains::schedules::cron_expr::CronExpression;
use crate::kernel::jobs::{JobKind, JobRequest};

fn default_discovery_method() -> String {
    "tcp".to_string()
}

/// What a schedule creates each time it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleConfig {
    Scan {
        targets: Vec<String>,
        #[serde(default)]
        ports: Option<String>,
        #[serde(default)]
        scan_type: Option<String>,
        #[serde(default)]
        profile_id: Option<String>,
    },
    /// A scan of whichever known hosts match `filter` when the schedule
    /// fires.
    HostScan {
        #[serde(default)]
        filter: HostFilter,
        #[serde(default)]
        ports: Option<String>,
        #[serde(default)]
        scan_type: Option<String>,
        #[serde(default)]
        profile_id: Option<String>,
    },
    Discovery {
        network: String,
        #[serde(default = "default_discovery_method")]
        method: String,
    },
}

impl ScheduleConfig {
    pub fn job_kind(&self) -> JobKind {
        match self {
            ScheduleConfig::Scan { .. } | ScheduleConfig::HostScan { .. } => JobKind::Scan,
            ScheduleConfig::Discovery { .. } => JobKind::Discovery,
        }
    }

    /// Set for schedules whose targets are looked up at firing time.
    pub fn host_filter(&self) -> Option<&HostFilter> {
        match self {
            ScheduleConfig::HostScan { filter, .. } => Some(filter),
            _ => None,
        }
    }

    /// The job request for one firing of `schedule_id` at `scheduled_for`.
    /// Host-filtered scans come back with no targets; the caller fills them
    /// from the hosts that match.
    pub fn job_request(
        &self,
        schedule_id: ScheduleId,
        scheduled_for: DateTime<Utc>,
    ) -> JobRequest {
        let scan = |targets: Vec<String>,
                    ports: &Option<String>,
                    scan_type: &Option<String>,
                    profile_id: &Option<String>| {
            JobRequest::Scan(NewScanJob {
                targets,
                ports: ports.clone(),
                scan_type: scan_type.clone(),
                profile_id: profile_id.clone(),
                schedule_id: Some(schedule_id),
                scheduled_for: Some(scheduled_for),
            })
        };
        match self {
            ScheduleConfig::Scan {
                targets,
                ports,
                scan_type,
                profile_id,
            } => scan(targets.clone(), ports, scan_type, profile_id),
            ScheduleConfig::HostScan {
                ports,
                scan_type,
                profile_id,
                ..
            } => scan(Vec::new(), ports, scan_type, profile_id),
            ScheduleConfig::Discovery { network, method } => {
                JobRequest::Discovery(NewDiscoveryJob {
                    network: network.clone(),
                    method: method.clone(),
                    schedule_id: Some(schedule_id),
                    scheduled_for: Some(scheduled_for),
                })
            }
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(filter) = self.host_filter() {
            filter.validate()?;
        }
        match self.job_request(ScheduleId::new(), Utc::now()) {
            JobRequest::Scan(new) if self.host_filter().is_some() => new.validate_settings(),
            JobRequest::Scan(new) => new.validate(),
            JobRequest::Discovery(new) => new.validate().map(|_| ()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Schedule {
    pub id: ScheduleId,
    pub name: String,
    pub job_kind: JobKind,
    pub cron_expression: String,
    pub config: Json<ScheduleConfig>,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    /// Owned by the scheduler; only advanced by a successful firing claim.
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewSchedule {
    pub name: String,
    pub cron_expression: String,
    pub config: ScheduleConfig,
    #[builder(default = true)]
    pub enabled: bool,
}

impl NewSchedule {
    pub fn validate(&self) -> Result<CronExpression, ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::new("schedule name must not be empty"));
        }
        let cron = CronExpression::parse(&self.cron_expression)?;
        self.config.validate()?;
        Ok(cron)
    }
}

impl Schedule {
    pub fn cron(&self) -> Result<CronExpression, ValidationError> {
        CronExpression::parse(&self.cron_expression)
    }

    pub async fn insert(
        new: &NewSchedule,
        cron: &CronExpression,
        next_run: Option<DateTime<Utc>>,
        pool: &PgPool,
    ) -> StoreResult<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO schedules (id, name, job_kind, cron_expression, config, enabled, next_run)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(ScheduleId::new())
        .bind(new.name.trim())
        .bind(new.config.job_kind())
        .bind(cron.as_str())
        .bind(Json(&new.config))
        .bind(new.enabled)
        .bind(next_run)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(id: ScheduleId, pool: &PgPool) -> StoreResult<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn list(pool: &PgPool) -> StoreResult<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM schedules ORDER BY name, id")
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }

    /// Enabled schedules whose `next_run` has elapsed, oldest first.
    pub async fn find_due(now: DateTime<Utc>, limit: i64, pool: &PgPool) -> StoreResult<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM schedules
            WHERE enabled AND next_run IS NOT NULL AND next_run <= $1
            ORDER BY next_run, id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Claims one firing: advances the run pointers only if `next_run` still
    /// holds the value this caller observed. Under concurrent evaluation the
    /// losers re-check the predicate after the winner commits and match
    /// zero rows.
    pub async fn claim_firing(
        id: ScheduleId,
        observed_next_run: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
        conn: &mut PgConnection,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET last_run = $3, next_run = $4, updated_at = NOW()
            WHERE id = $1 AND enabled AND next_run = $2
            "#,
        )
        .bind(id)
        .bind(observed_next_run)
        .bind(fired_at)
        .bind(next_run)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_enabled(
        id: ScheduleId,
        enabled: bool,
        next_run: Option<DateTime<Utc>>,
        pool: &PgPool,
    ) -> StoreResult<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE schedules
            SET enabled = $2, next_run = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(enabled)
        .bind(next_run)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn delete(id: ScheduleId, pool: &PgPool) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
