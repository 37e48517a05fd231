//! Integration tests for lifecycle transitions against the database.
//!
//! Terminal states are absorbing: once completed, failed, or cancelled, no
//! gateway operation moves a job anywhere else.

mod common;

use crate::common::{create_running_scan_job, create_scan_job, unique_ip, TestHarness};
use recon_core::common::{OrchestratorError, ScanJobId, StoreError};
use recon_core::domains::discovery::models::NewDiscoveryJob;
use recon_core::domains::scans::models::NewScanJob;
use recon_core::kernel::jobs::{Job, JobKind, JobRef, JobStatus};
use recon_core::kernel::persistence::CANCELLED_REASON;
use test_context::test_context;

/// Every transition attempt on a terminal job is refused and leaves the
/// row as it was.
async fn assert_absorbed(ctx: &TestHarness, job_ref: JobRef, expected: JobStatus) {
    let gateway = ctx.gateway();
    let before = gateway.get_job(job_ref).await.unwrap().unwrap();
    assert_eq!(before.status(), expected);

    assert!(matches!(
        gateway.claim_job(job_ref, "late-worker").await,
        Err(StoreError::ConstraintViolation(_))
    ));
    assert!(matches!(
        gateway.cancel_job(job_ref).await,
        Err(StoreError::ConstraintViolation(_))
    ));
    assert!(gateway.fail_job(job_ref, "late failure").await.unwrap().is_none());
    assert!(!gateway.record_progress(job_ref, 99).await.unwrap());
    assert!(!gateway.heartbeat(job_ref).await.unwrap());
    if let JobRef::Scan(id) = job_ref {
        assert!(matches!(
            gateway.complete_scan_job(id, &[]).await,
            Err(StoreError::ConstraintViolation(_))
        ));
    }

    let after = gateway.get_job(job_ref).await.unwrap().unwrap();
    assert_eq!(after.status(), expected);
    assert_eq!(after.progress(), before.progress());
    assert_eq!(after.error_message(), before.error_message());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn completed_job_is_terminal(ctx: &TestHarness) {
    let gateway = ctx.gateway();
    let job = create_running_scan_job(&gateway, unique_ip()).await;

    let completed = gateway.complete_scan_job(job.id, &[]).await.unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.progress, 100);
    assert!(completed.completed_at.is_some());

    assert_absorbed(ctx, JobRef::Scan(job.id), JobStatus::Completed).await;
}

#[test_context(TestHarness)]
#[tokio::test]
async fn failed_job_is_terminal(ctx: &TestHarness) {
    let gateway = ctx.gateway();
    let job = create_running_scan_job(&gateway, unique_ip()).await;
    let job_ref = JobRef::Scan(job.id);

    let failed = gateway.fail_job(job_ref, "probe exploded").await.unwrap().unwrap();
    assert_eq!(failed.status(), JobStatus::Failed);
    assert_eq!(failed.error_message(), Some("probe exploded"));

    assert_absorbed(ctx, job_ref, JobStatus::Failed).await;
}

#[test_context(TestHarness)]
#[tokio::test]
async fn cancelled_pending_job_is_terminal(ctx: &TestHarness) {
    let gateway = ctx.gateway();
    let job = create_scan_job(&gateway, unique_ip()).await;
    let job_ref = JobRef::Scan(job.id);

    let cancelled = gateway.cancel_job(job_ref).await.unwrap();
    assert_eq!(cancelled.status(), JobStatus::Cancelled);
    assert_eq!(cancelled.error_message(), Some(CANCELLED_REASON));

    assert_absorbed(ctx, job_ref, JobStatus::Cancelled).await;
}

#[test_context(TestHarness)]
#[tokio::test]
async fn running_job_can_be_cancelled(ctx: &TestHarness) {
    let gateway = ctx.gateway();
    let job = create_running_scan_job(&gateway, unique_ip()).await;
    let job_ref = JobRef::Scan(job.id);

    let cancelled = gateway.cancel_job(job_ref).await.unwrap();
    assert_eq!(cancelled.status(), JobStatus::Cancelled);
    assert_absorbed(ctx, job_ref, JobStatus::Cancelled).await;
}

#[test_context(TestHarness)]
#[tokio::test]
async fn cancelling_a_missing_job_is_not_found(ctx: &TestHarness) {
    let err = ctx
        .gateway()
        .cancel_job(JobRef::Scan(ScanJobId::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn progress_only_moves_forward_while_running(ctx: &TestHarness) {
    let gateway = ctx.gateway();
    let pending = create_scan_job(&gateway, unique_ip()).await;
    assert!(!gateway.record_progress(JobRef::Scan(pending.id), 10).await.unwrap());

    let job = create_running_scan_job(&gateway, unique_ip()).await;
    let job_ref = JobRef::Scan(job.id);
    assert!(gateway.record_progress(job_ref, 60).await.unwrap());
    assert!(gateway.record_progress(job_ref, 10).await.unwrap());

    let stored = gateway.get_job(job_ref).await.unwrap().unwrap();
    assert_eq!(stored.progress(), 60);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn orchestrator_validates_before_writing(ctx: &TestHarness) {
    let orchestrator = ctx.orchestrator(crate::common::test_worker_config());

    let bad_ports = NewScanJob::builder()
        .targets(vec![unique_ip().to_string()])
        .ports("80-22")
        .build();
    assert!(matches!(
        orchestrator.create_scan_job(bad_ports).await,
        Err(OrchestratorError::Validation(_))
    ));

    let no_targets = NewScanJob::builder().targets(Vec::<String>::new()).ports("80").build();
    assert!(matches!(
        orchestrator.create_scan_job(no_targets).await,
        Err(OrchestratorError::Validation(_))
    ));

    let bad_network = NewDiscoveryJob::builder().network("10.0.0.0/33").build();
    assert!(matches!(
        orchestrator.create_discovery_job(bad_network).await,
        Err(OrchestratorError::Validation(_))
    ));

    let bad_method = NewDiscoveryJob::builder()
        .network("10.9.0.0/24")
        .method("carrier-pigeon")
        .build();
    assert!(matches!(
        orchestrator.create_discovery_job(bad_method).await,
        Err(OrchestratorError::Validation(_))
    ));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn created_jobs_are_pending_and_listed(ctx: &TestHarness) {
    let orchestrator = ctx.orchestrator(crate::common::test_worker_config());

    let scan = orchestrator
        .create_scan_job(crate::common::new_scan_job(unique_ip(), "443"))
        .await
        .unwrap();
    let discovery = orchestrator
        .create_discovery_job(NewDiscoveryJob::builder().network("10.200.3.7/24").build())
        .await
        .unwrap();

    assert_eq!(scan.status, JobStatus::Pending);
    assert_eq!(scan.progress, 0);
    assert_eq!(discovery.status, JobStatus::Pending);
    assert_eq!(discovery.network.to_string(), "10.200.3.0/24");

    let fetched = orchestrator.get_job(JobRef::Scan(scan.id)).await.unwrap();
    assert!(matches!(fetched, Job::Scan(ref s) if s.id == scan.id));

    let pending = orchestrator
        .list_jobs_by_status(Some(JobKind::Discovery), JobStatus::Pending, 1000)
        .await
        .unwrap();
    assert!(pending.iter().any(|j| j.job_ref() == JobRef::Discovery(discovery.id)));
    assert!(pending.iter().all(|j| j.job_ref().kind() == JobKind::Discovery));

    assert!(matches!(
        orchestrator.get_job(JobRef::Scan(ScanJobId::new())).await,
        Err(OrchestratorError::NotFound(_))
    ));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn negative_list_limits_are_rejected(ctx: &TestHarness) {
    let orchestrator = ctx.orchestrator(crate::common::test_worker_config());
    create_scan_job(&ctx.gateway(), unique_ip()).await;

    assert!(matches!(
        orchestrator
            .list_jobs_by_status(None, JobStatus::Pending, -1)
            .await,
        Err(OrchestratorError::Validation(_))
    ));
    assert!(matches!(
        orchestrator.list_hosts(-10, 0).await,
        Err(OrchestratorError::Validation(_))
    ));

    // The gateway clamps instead of handing Postgres a negative LIMIT.
    let none = ctx
        .gateway()
        .list_jobs_by_status(Some(JobKind::Scan), JobStatus::Pending, -1)
        .await
        .unwrap();
    assert!(none.is_empty());
    assert!(ctx.gateway().list_hosts(-1, -1).await.unwrap().is_empty());
    assert!(orchestrator
        .list_jobs_by_status(None, JobStatus::Pending, 0)
        .await
        .unwrap()
        .is_empty());
}
