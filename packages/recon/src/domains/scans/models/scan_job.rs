use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use typed_builder::TypedBuilder;

use crate::common::{ScanJobId, ScheduleId, StoreResult, ValidationError};
use crate::domains::profiles::models::ScanProfile;
use crate::domains::scans::targets::{parse_ports, validate_targets};
use crate::kernel::jobs::JobStatus;

pub const SCAN_TYPES: [&str; 5] = ["connect", "syn", "ack", "aggressive", "comprehensive"];
pub const DEFAULT_SCAN_TYPE: &str = "connect";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScanJob {
    pub id: ScanJobId,
    pub targets: Vec<String>,
    pub scan_type: String,
    pub ports: String,
    pub profile_id: Option<String>,
    pub status: JobStatus,
    pub progress: i32,
    pub error_message: Option<String>,
    pub claimed_by: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub schedule_id: Option<ScheduleId>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A scan request. Ports and scan type left out are taken from the
/// referenced profile when the job is written.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewScanJob {
    pub targets: Vec<String>,
    #[builder(default, setter(strip_option))]
    pub ports: Option<String>,
    #[builder(default, setter(strip_option))]
    pub scan_type: Option<String>,
    #[builder(default, setter(strip_option))]
    pub profile_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub schedule_id: Option<ScheduleId>,
    #[builder(default, setter(strip_option))]
    pub scheduled_for: Option<DateTime<Utc>>,
}

fn check_scan_type(scan_type: &str) -> Result<(), ValidationError> {
    if SCAN_TYPES.contains(&scan_type) {
        Ok(())
    } else {
        Err(ValidationError::new(format!("unknown scan type '{}'", scan_type)))
    }
}

impl NewScanJob {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_targets(&self.targets)?;
        self.validate_settings()
    }

    /// Everything but the targets, for requests whose targets are only
    /// known later.
    pub fn validate_settings(&self) -> Result<(), ValidationError> {
        match (&self.ports, &self.profile_id) {
            (Some(ports), _) => {
                parse_ports(ports)?;
            }
            (None, Some(_)) => {}
            (None, None) => {
                return Err(ValidationError::new(
                    "scan job needs a port specification or a scan profile",
                ))
            }
        }
        if let Some(scan_type) = &self.scan_type {
            check_scan_type(scan_type)?;
        }
        Ok(())
    }

    /// The ports and scan type to store: the request's own values first,
    /// then the profile's, then a connect scan.
    pub fn resolve(&self, profile: Option<&ScanProfile>) -> Result<ResolvedScan, ValidationError> {
        let ports = self
            .ports
            .clone()
            .or_else(|| profile.map(|p| p.ports.clone()))
            .ok_or_else(|| {
                ValidationError::new("scan job needs a port specification or a scan profile")
            })?;
        parse_ports(&ports)?;
        let scan_type = self
            .scan_type
            .clone()
            .or_else(|| profile.map(|p| p.scan_type.clone()))
            .unwrap_or_else(|| DEFAULT_SCAN_TYPE.to_string());
        check_scan_type(&scan_type)?;
        Ok(ResolvedScan { ports, scan_type })
    }
}

/// Concrete scan settings after profile defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScan {
    pub ports: String,
    pub scan_type: String,
}

impl ScanJob {
    pub fn port_list(&self) -> Result<Vec<u16>, ValidationError> {
        parse_ports(&self.ports)
    }

    pub async fn insert(
        new: &NewScanJob,
        resolved: &ResolvedScan,
        conn: &mut PgConnection,
    ) -> StoreResult<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO scan_jobs (id, targets, scan_type, ports, profile_id, schedule_id, scheduled_for)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(ScanJobId::new())
        .bind(&new.targets)
        .bind(&resolved.scan_type)
        .bind(&resolved.ports)
        .bind(&new.profile_id)
        .bind(new.schedule_id)
        .bind(new.scheduled_for)
        .fetch_one(&mut *conn)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(id: ScanJobId, pool: &PgPool) -> StoreResult<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM scan_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn list_by_status(
        status: JobStatus,
        limit: i64,
        pool: &PgPool,
    ) -> StoreResult<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM scan_jobs WHERE status = $1 ORDER BY created_at, id LIMIT $2",
        )
        .bind(status)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Removes the job and, by cascade, its port results.
    pub async fn delete(id: ScanJobId, conn: &mut PgConnection) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM scan_jobs WHERE id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
