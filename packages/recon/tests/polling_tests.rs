//! Integration tests for pending-job polling and the stale-job reaper.
//!
//! Polling claims any pending job in the database, so this lives in its own
//! test binary (with its own container) and its tests run one at a time.

mod common;

use crate::common::{
    create_running_scan_job, create_scan_job, test_worker_config, unique_ip, wait_for_terminal,
    TestHarness,
};
use recon_core::kernel::jobs::{JobKind, JobRef, JobStatus, WorkerPoolConfig};
use recon_core::kernel::persistence::LEASE_EXPIRED_REASON;
use std::collections::HashSet;
use std::time::Duration;
use test_context::test_context;
use tokio::sync::Mutex;
use tokio_test::assert_ok;
use uuid::Uuid;

static SERIAL: Mutex<()> = Mutex::const_new(());

#[test_context(TestHarness)]
#[tokio::test]
async fn concurrent_pollers_never_share_a_job(ctx: &TestHarness) {
    let _serial = SERIAL.lock().await;
    let gateway = ctx.gateway();
    let mut mine = HashSet::new();
    for _ in 0..6 {
        mine.insert(create_scan_job(&gateway, unique_ip()).await.id.into_uuid());
    }

    let (a, b) = tokio::join!(
        gateway.claim_next_pending(JobKind::Scan, "poller-a", 100),
        gateway.claim_next_pending(JobKind::Scan, "poller-b", 100),
    );
    let a = assert_ok!(a);
    let b = assert_ok!(b);

    let a_ids: HashSet<Uuid> = a.iter().map(|j| j.job_ref().uuid()).collect();
    let b_ids: HashSet<Uuid> = b.iter().map(|j| j.job_ref().uuid()).collect();
    assert!(a_ids.is_disjoint(&b_ids), "a job was claimed by both pollers");

    let claimed: HashSet<Uuid> = a_ids.union(&b_ids).copied().collect();
    assert!(mine.is_subset(&claimed), "every pending job is claimed once");
    for job in a.iter().chain(b.iter()) {
        assert_eq!(job.status(), JobStatus::Running);
    }
}

#[test_context(TestHarness)]
#[tokio::test]
async fn polling_respects_the_limit(ctx: &TestHarness) {
    let _serial = SERIAL.lock().await;
    let gateway = ctx.gateway();
    for _ in 0..3 {
        create_scan_job(&gateway, unique_ip()).await;
    }

    let claimed = assert_ok!(gateway.claim_next_pending(JobKind::Scan, "poller", 2).await);
    assert_eq!(claimed.len(), 2);

    // Drain the rest so later tests start from an empty queue.
    assert_ok!(gateway.claim_next_pending(JobKind::Scan, "poller", 100).await);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn stale_running_jobs_are_failed(ctx: &TestHarness) {
    let _serial = SERIAL.lock().await;
    let gateway = ctx.gateway();
    let stale = create_running_scan_job(&gateway, unique_ip()).await;
    let fresh = create_running_scan_job(&gateway, unique_ip()).await;

    sqlx::query("UPDATE scan_jobs SET heartbeat_at = NOW() - interval '1 hour' WHERE id = $1")
        .bind(stale.id)
        .execute(&ctx.db_pool)
        .await
        .unwrap();

    let reaped = assert_ok!(
        gateway
            .reap_stale_jobs(JobKind::Scan, Duration::from_secs(600))
            .await
    );
    let reaped: Vec<JobRef> = reaped.iter().map(|j| j.job_ref()).collect();
    assert!(reaped.contains(&JobRef::Scan(stale.id)));
    assert!(!reaped.contains(&JobRef::Scan(fresh.id)));

    let stale = gateway.get_job(JobRef::Scan(stale.id)).await.unwrap().unwrap();
    assert_eq!(stale.status(), JobStatus::Failed);
    assert_eq!(stale.error_message(), Some(LEASE_EXPIRED_REASON));

    // A heartbeat on a failed job is a no-op.
    assert!(!assert_ok!(gateway.heartbeat(stale.job_ref()).await));
    assert!(assert_ok!(gateway.heartbeat(JobRef::Scan(fresh.id)).await));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn polling_pool_runs_pending_jobs(ctx: &TestHarness) {
    let _serial = SERIAL.lock().await;
    let config = WorkerPoolConfig {
        poll_pending: true,
        min_poll_interval: Duration::from_millis(50),
        max_poll_interval: Duration::from_millis(200),
        ..test_worker_config()
    };
    let worker_id = config.worker_id.clone();
    let orchestrator = ctx.orchestrator(config);

    let job = create_scan_job(&ctx.gateway(), unique_ip()).await;
    let job_ref = JobRef::Scan(job.id);

    let finished = wait_for_terminal(&ctx.gateway(), job_ref, Duration::from_secs(10)).await;
    assert_eq!(finished.status(), JobStatus::Completed);
    assert_eq!(
        finished.as_scan().unwrap().claimed_by.as_deref(),
        Some(worker_id.as_str())
    );

    orchestrator.workers().shutdown().await;
}

#[test_context(TestHarness)]
#[tokio::test]
async fn non_polling_pool_still_reaps_orphans(ctx: &TestHarness) {
    let _serial = SERIAL.lock().await;
    let gateway = ctx.gateway();
    let orphan = create_running_scan_job(&gateway, unique_ip()).await;
    sqlx::query("UPDATE scan_jobs SET heartbeat_at = NOW() - interval '1 hour' WHERE id = $1")
        .bind(orphan.id)
        .execute(&ctx.db_pool)
        .await
        .unwrap();

    let orchestrator = ctx.orchestrator(WorkerPoolConfig {
        poll_pending: false,
        heartbeat_interval: Duration::from_millis(100),
        stale_after: Duration::from_secs(60),
        ..test_worker_config()
    });

    let reaped = wait_for_terminal(&gateway, JobRef::Scan(orphan.id), Duration::from_secs(10)).await;
    assert_eq!(reaped.status(), JobStatus::Failed);
    assert_eq!(reaped.error_message(), Some(LEASE_EXPIRED_REASON));

    orchestrator.workers().shutdown().await;
}
