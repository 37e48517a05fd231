use chrono::{DateTime, Duration, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;

use super::host::Host;
use crate::common::{StoreError, StoreResult, ValidationError};

/// Selects known hosts as scan targets. Empty lists and unset fields do
/// not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFilter {
    /// Only hosts whose last sighting found them up.
    #[serde(default)]
    pub live_hosts_only: bool,
    /// CIDR blocks a host must fall inside (any of them).
    #[serde(default)]
    pub networks: Vec<String>,
    /// OS families to include, compared case-insensitively.
    #[serde(default)]
    pub os_family: Vec<String>,
    /// Only hosts seen within this many hours of the firing.
    #[serde(default)]
    pub max_age_hours: Option<u32>,
}

impl HostFilter {
    pub fn networks(&self) -> Result<Vec<IpNetwork>, ValidationError> {
        self.networks
            .iter()
            .map(|raw| {
                raw.trim().parse::<IpNetwork>().map_err(|_| {
                    ValidationError::new(format!("invalid network '{}' in host filter", raw))
                })
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.networks()?;
        if self.max_age_hours == Some(0) {
            return Err(ValidationError::new("max_age_hours must be at least 1"));
        }
        Ok(())
    }

    fn seen_since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.max_age_hours
            .map(|hours| now - Duration::hours(i64::from(hours)))
    }
}

impl Host {
    /// Hosts selected by `filter` as of `now`, most recently seen first.
    pub async fn matching(
        filter: &HostFilter,
        now: DateTime<Utc>,
        limit: i64,
        conn: &mut PgConnection,
    ) -> StoreResult<Vec<Self>> {
        let networks = filter
            .networks()
            .map_err(|e| StoreError::ConstraintViolation(e.to_string()))?;
        let families: Vec<String> = filter
            .os_family
            .iter()
            .map(|f| f.trim().to_lowercase())
            .collect();

        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM hosts
            WHERE (NOT $1 OR active)
              AND ($2::timestamptz IS NULL OR last_seen >= $2)
              AND (cardinality($3::text[]) = 0 OR lower(os_family) = ANY($3))
              AND (cardinality($4::inet[]) = 0 OR ip_address <<= ANY($4))
            ORDER BY last_seen DESC, id
            LIMIT $5
            "#,
        )
        .bind(filter.live_hosts_only)
        .bind(filter.seen_since(now))
        .bind(&families)
        .bind(&networks)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(Into::into)
    }
}
