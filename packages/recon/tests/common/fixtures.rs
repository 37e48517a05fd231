//! Test fixtures for creating test data.
//!
//! These fixtures go through the persistence gateway so rows are created
//! exactly the way production code creates them.

use recon_core::common::ScanJobId;
use recon_core::domains::hosts::models::{Host, HostSighting};
use recon_core::domains::scans::models::{NewScanJob, PortScanResult, ScanJob};
use recon_core::kernel::jobs::{Job, JobRef, WorkerPoolConfig};
use recon_core::kernel::PersistenceGateway;
use sqlx::PgPool;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use uuid::Uuid;

static NEXT_ADDRESS: AtomicU32 = AtomicU32::new(1);

/// A 10.x.y.z address no other test in this binary will use.
pub fn unique_ip() -> IpAddr {
    let n = NEXT_ADDRESS.fetch_add(1, Ordering::Relaxed);
    IpAddr::V4(Ipv4Addr::from(0x0A00_0000 | (n & 0x00FF_FFFF)))
}

/// Pool config for tests: push dispatch only, so pools in concurrent tests
/// never claim each other's pending jobs.
pub fn test_worker_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        pool_size: 4,
        queue_capacity: 16,
        poll_pending: false,
        job_timeout: Duration::from_secs(30),
        shutdown_grace: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(1),
        stale_after: Duration::from_secs(600),
        ..WorkerPoolConfig::with_worker_id(format!("test-worker-{}", Uuid::new_v4()))
    }
}

pub fn new_scan_job(ip: IpAddr, ports: &str) -> NewScanJob {
    NewScanJob::builder()
        .targets(vec![ip.to_string()])
        .ports(ports)
        .build()
}

pub fn open_port(ip: IpAddr, port: u16) -> PortScanResult {
    PortScanResult::builder().ip(ip).port(port).build()
}

pub async fn create_scan_job(gateway: &PersistenceGateway, ip: IpAddr) -> ScanJob {
    gateway
        .create_scan_job(&new_scan_job(ip, "22,80"))
        .await
        .expect("Failed to create scan job")
}

/// A scan job already claimed by a fixture worker id.
pub async fn create_running_scan_job(gateway: &PersistenceGateway, ip: IpAddr) -> ScanJob {
    let job = create_scan_job(gateway, ip).await;
    match gateway
        .claim_job(JobRef::Scan(job.id), "fixture-worker")
        .await
        .expect("Failed to claim scan job")
    {
        Job::Scan(scan) => scan,
        other => panic!("expected scan job, got {:?}", other),
    }
}

pub async fn create_host(gateway: &PersistenceGateway, ip: IpAddr) -> Host {
    gateway
        .upsert_host(&HostSighting::builder().ip(ip).build())
        .await
        .expect("Failed to create host")
}

pub async fn count_port_scans(pool: &PgPool, job_id: ScanJobId) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM port_scans WHERE job_id = $1")
        .bind(job_id)
        .fetch_one(pool)
        .await
        .expect("Failed to count port scans")
}

/// Polls until `job` reaches a terminal state. Panics after `timeout`.
pub async fn wait_for_terminal(gateway: &PersistenceGateway, job: JobRef, timeout: Duration) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(current) = gateway.get_job(job).await.expect("Failed to read job") {
            if current.status().is_terminal() {
                return current;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("{} did not reach a terminal state within {:?}", job, timeout);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
