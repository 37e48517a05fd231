use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use typed_builder::TypedBuilder;

use crate::common::{DiscoveryJobId, ScheduleId, StoreResult, ValidationError};
use crate::domains::hosts::HostSighting;
use crate::kernel::jobs::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    Ping,
    Arp,
    Tcp,
}

impl DiscoveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMethod::Ping => "ping",
            DiscoveryMethod::Arp => "arp",
            DiscoveryMethod::Tcp => "tcp",
        }
    }
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscoveryMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ping" => Ok(DiscoveryMethod::Ping),
            "arp" => Ok(DiscoveryMethod::Arp),
            "tcp" => Ok(DiscoveryMethod::Tcp),
            other => Err(ValidationError::new(format!(
                "unknown discovery method '{}' (expected ping, arp, or tcp)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DiscoveryJob {
    pub id: DiscoveryJobId,
    pub network: IpNetwork,
    pub method: String,
    pub status: JobStatus,
    pub progress: i32,
    pub hosts_discovered: i32,
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

impl DiscoveryJob {
    pub fn method(&self) -> Result<DiscoveryMethod, ValidationError> {
        self.method.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewDiscoveryJob {
    /// CIDR notation, e.g. `192.168.1.0/24`.
    pub network: String,
    #[builder(default = "tcp".to_string())]
    pub method: String,
    #[builder(default, setter(strip_option))]
    pub schedule_id: Option<ScheduleId>,
    #[builder(default, setter(strip_option))]
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl NewDiscoveryJob {
    /// Parses the network and method, rejecting networks too wide to sweep.
    /// The returned network has its host bits cleared.
    pub fn validate(&self) -> Result<(IpNetwork, DiscoveryMethod), ValidationError> {
        let network: IpNetwork = self.network.trim().parse().map_err(|e| {
            ValidationError::new(format!("invalid network '{}': {}", self.network, e))
        })?;
        let too_wide = match network {
            IpNetwork::V4(v4) => v4.prefix() < 16,
            IpNetwork::V6(v6) => v6.prefix() < 112,
        };
        if too_wide {
            return Err(ValidationError::new(format!(
                "network '{}' is too large to sweep",
                self.network
            )));
        }
        let method = self.method.parse()?;
        // CIDR columns reject host bits to the right of the mask.
        let network = IpNetwork::new(network.network(), network.prefix())
            .map_err(|e| ValidationError::new(e.to_string()))?;
        Ok((network, method))
    }
}

/// A live host reported by a discovery probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct DiscoveredHost {
    pub ip: IpAddr,
    #[builder(default, setter(strip_option))]
    pub hostname: Option<String>,
    #[builder(default, setter(strip_option))]
    pub mac_address: Option<String>,
    #[builder(default, setter(strip_option))]
    pub vendor: Option<String>,
    #[builder(default, setter(strip_option))]
    pub response_time_ms: Option<i32>,
}

impl DiscoveredHost {
    pub fn into_sighting(
        self,
        job_id: DiscoveryJobId,
        method: DiscoveryMethod,
        seen_at: DateTime<Utc>,
    ) -> HostSighting {
        HostSighting {
            ip: self.ip,
            hostname: self.hostname,
            mac_address: self.mac_address,
            vendor: self.vendor,
            os_family: None,
            os_name: None,
            os_version: None,
            response_time_ms: self.response_time_ms,
            discovered_by: Some(method.as_str().to_string()),
            discovery_job_id: Some(job_id),
            metadata: serde_json::json!({}),
            active: true,
            seen_at,
        }
    }
}

impl DiscoveryJob {
    pub async fn insert(
        network: IpNetwork,
        method: DiscoveryMethod,
        new: &NewDiscoveryJob,
        conn: &mut PgConnection,
    ) -> StoreResult<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO discovery_jobs (id, network, method, schedule_id, scheduled_for)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(DiscoveryJobId::new())
        .bind(network)
        .bind(method.as_str())
        .bind(new.schedule_id)
        .bind(new.scheduled_for)
        .fetch_one(&mut *conn)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(id: DiscoveryJobId, pool: &PgPool) -> StoreResult<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM discovery_jobs WHERE id = $1")
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
            "SELECT * FROM discovery_jobs WHERE status = $1 ORDER BY created_at, id LIMIT $2",
        )
        .bind(status)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }
}
