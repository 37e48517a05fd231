use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ipnetwork::IpNetwork;
use sqlx::{PgConnection, PgPool};
use std::net::IpAddr;
use typed_builder::TypedBuilder;

use crate::common::{DiscoveryJobId, HostId, StoreResult};

/// A network endpoint, unique by IP address.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Host {
    pub id: HostId,
    pub ip_address: IpNetwork,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub vendor: Option<String>,
    pub os_family: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub response_time_ms: Option<i32>,
    pub discovered_by: Option<String>,
    pub discovery_job_id: Option<DiscoveryJobId>,
    pub metadata: serde_json::Value,
    pub active: bool,
    pub discovery_count: i32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Host {
    pub fn ip(&self) -> IpAddr {
        self.ip_address.ip()
    }
}

/// One observation of a host. Upserting a sighting inserts the host on
/// first contact and refreshes it on every later one.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct HostSighting {
    pub ip: IpAddr,
    #[builder(default, setter(strip_option))]
    pub hostname: Option<String>,
    #[builder(default, setter(strip_option))]
    pub mac_address: Option<String>,
    #[builder(default, setter(strip_option))]
    pub vendor: Option<String>,
    #[builder(default, setter(strip_option))]
    pub os_family: Option<String>,
    #[builder(default, setter(strip_option))]
    pub os_name: Option<String>,
    #[builder(default, setter(strip_option))]
    pub os_version: Option<String>,
    #[builder(default, setter(strip_option))]
    pub response_time_ms: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub discovered_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub discovery_job_id: Option<DiscoveryJobId>,
    /// Merged key-by-key into the stored metadata object.
    #[builder(default = serde_json::Value::Object(Default::default()))]
    pub metadata: serde_json::Value,
    #[builder(default = true)]
    pub active: bool,
    #[builder(default = Utc::now())]
    pub seen_at: DateTime<Utc>,
}

impl Host {
    /// Insert-or-refresh keyed on IP address in a single statement.
    ///
    /// Concurrent sightings of the same address serialize on the unique
    /// index; `last_seen` only ever moves forward and `discovery_count`
    /// counts every sighting.
    pub async fn upsert(sighting: &HostSighting, conn: &mut PgConnection) -> StoreResult<Self> {
        let metadata = match &sighting.metadata {
            serde_json::Value::Object(_) => sighting.metadata.clone(),
            _ => serde_json::json!({}),
        };

        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO hosts (
                id, ip_address, hostname, mac_address, vendor, os_family, os_name,
                os_version, response_time_ms, discovered_by, discovery_job_id,
                metadata, active, discovery_count, first_seen, last_seen
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 1, $14, $14)
            ON CONFLICT (ip_address) DO UPDATE SET
                hostname = COALESCE(EXCLUDED.hostname, hosts.hostname),
                mac_address = COALESCE(EXCLUDED.mac_address, hosts.mac_address),
                vendor = COALESCE(EXCLUDED.vendor, hosts.vendor),
                os_family = COALESCE(EXCLUDED.os_family, hosts.os_family),
                os_name = COALESCE(EXCLUDED.os_name, hosts.os_name),
                os_version = COALESCE(EXCLUDED.os_version, hosts.os_version),
                response_time_ms = COALESCE(EXCLUDED.response_time_ms, hosts.response_time_ms),
                discovered_by = COALESCE(hosts.discovered_by, EXCLUDED.discovered_by),
                discovery_job_id = COALESCE(hosts.discovery_job_id, EXCLUDED.discovery_job_id),
                metadata = hosts.metadata || EXCLUDED.metadata,
                active = EXCLUDED.active,
                discovery_count = hosts.discovery_count + 1,
                first_seen = LEAST(hosts.first_seen, EXCLUDED.first_seen),
                last_seen = GREATEST(hosts.last_seen, EXCLUDED.last_seen)
            RETURNING *
            "#,
        )
        .bind(HostId::new())
        .bind(IpNetwork::from(sighting.ip))
        .bind(&sighting.hostname)
        .bind(&sighting.mac_address)
        .bind(&sighting.vendor)
        .bind(&sighting.os_family)
        .bind(&sighting.os_name)
        .bind(&sighting.os_version)
        .bind(sighting.response_time_ms)
        .bind(&sighting.discovered_by)
        .bind(sighting.discovery_job_id)
        .bind(metadata)
        .bind(sighting.active)
        .bind(sighting.seen_at)
        .fetch_one(&mut *conn)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(id: HostId, pool: &PgPool) -> StoreResult<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM hosts WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_ip(ip: IpAddr, pool: &PgPool) -> StoreResult<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM hosts WHERE ip_address = $1")
            .bind(IpNetwork::from(ip))
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn list(limit: i64, offset: i64, pool: &PgPool) -> StoreResult<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM hosts ORDER BY last_seen DESC, id LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Administrative removal. Blocks behind any transaction holding the
    /// row lock; cascades to the host's port results.
    pub async fn delete(id: HostId, conn: &mut PgConnection) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM hosts WHERE id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sighting_defaults_to_active_with_empty_metadata() {
        let sighting = HostSighting::builder()
            .ip("10.0.0.5".parse::<IpAddr>().unwrap())
            .build();
        assert!(sighting.active);
        assert_eq!(sighting.metadata, serde_json::json!({}));
        assert!(sighting.hostname.is_none());
    }

    #[test]
    fn sighting_builder_accepts_optional_fields() {
        let sighting = HostSighting::builder()
            .ip("192.168.1.10".parse::<IpAddr>().unwrap())
            .hostname("printer.lan")
            .discovered_by("tcp")
            .build();
        assert_eq!(sighting.hostname.as_deref(), Some("printer.lan"));
        assert_eq!(sighting.discovered_by.as_deref(), Some("tcp"));
    }
}
