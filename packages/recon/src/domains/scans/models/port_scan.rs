use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use std::net::IpAddr;
use typed_builder::TypedBuilder;

use crate::common::{HostId, PortScanId, ScanJobId, StoreResult};

/// A persisted port result. `host_id` and `job_id` always reference live
/// rows at commit time.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PortScan {
    pub id: PortScanId,
    pub job_id: ScanJobId,
    pub host_id: HostId,
    pub port: i32,
    pub protocol: String,
    pub state: String,
    pub service_name: Option<String>,
    pub service_version: Option<String>,
    pub service_product: Option<String>,
    pub banner: Option<String>,
    pub scanned_at: DateTime<Utc>,
}

/// What a scan probe reports for one port on one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct PortScanResult {
    pub ip: IpAddr,
    pub port: u16,
    #[builder(default = "tcp".to_string())]
    pub protocol: String,
    #[builder(default = "open".to_string())]
    pub state: String,
    #[builder(default, setter(strip_option))]
    pub hostname: Option<String>,
    #[builder(default, setter(strip_option))]
    pub service_name: Option<String>,
    #[builder(default, setter(strip_option))]
    pub service_version: Option<String>,
    #[builder(default, setter(strip_option))]
    pub service_product: Option<String>,
    #[builder(default, setter(strip_option))]
    pub banner: Option<String>,
}

/// A port result resolved to its host row, ready to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPortScan {
    pub host_id: HostId,
    pub port: i32,
    pub protocol: String,
    pub state: String,
    pub service_name: Option<String>,
    pub service_version: Option<String>,
    pub service_product: Option<String>,
    pub banner: Option<String>,
}

impl NewPortScan {
    pub fn from_result(host_id: HostId, result: &PortScanResult) -> Self {
        Self {
            host_id,
            port: i32::from(result.port),
            protocol: result.protocol.clone(),
            state: result.state.clone(),
            service_name: result.service_name.clone(),
            service_version: result.service_version.clone(),
            service_product: result.service_product.clone(),
            banner: result.banner.clone(),
        }
    }
}

impl PortScan {
    /// Inserts every row for `job_id`. A result already recorded for the
    /// same (job, host, port, protocol) is refreshed instead.
    ///
    /// Callers must hold the guard's row locks on the job and every host
    /// referenced by `scans` in the same transaction.
    pub async fn insert_batch(
        job_id: ScanJobId,
        scans: &[NewPortScan],
        conn: &mut PgConnection,
    ) -> StoreResult<u64> {
        let mut written = 0;
        for scan in scans {
            let result = sqlx::query(
                r#"
                INSERT INTO port_scans (
                    id, job_id, host_id, port, protocol, state,
                    service_name, service_version, service_product, banner
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (job_id, host_id, port, protocol) DO UPDATE SET
                    state = EXCLUDED.state,
                    service_name = EXCLUDED.service_name,
                    service_version = EXCLUDED.service_version,
                    service_product = EXCLUDED.service_product,
                    banner = EXCLUDED.banner,
                    scanned_at = NOW()
                "#,
            )
            .bind(PortScanId::new())
            .bind(job_id)
            .bind(scan.host_id)
            .bind(scan.port)
            .bind(&scan.protocol)
            .bind(&scan.state)
            .bind(&scan.service_name)
            .bind(&scan.service_version)
            .bind(&scan.service_product)
            .bind(&scan.banner)
            .execute(&mut *conn)
            .await?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    pub async fn list_for_job(job_id: ScanJobId, pool: &PgPool) -> StoreResult<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM port_scans WHERE job_id = $1 ORDER BY host_id, port, protocol",
        )
        .bind(job_id)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn list_for_host(host_id: HostId, pool: &PgPool) -> StoreResult<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM port_scans WHERE host_id = $1 ORDER BY scanned_at DESC, port",
        )
        .bind(host_id)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }
}
