//! Integration tests for the exactly-once claim.
//!
//! Any number of concurrent claimers race on the same pending job; exactly
//! one moves it to running and the rest observe an already-claimed job.

mod common;

use crate::common::{
    create_scan_job, test_worker_config, unique_ip, wait_for_terminal, TestHarness,
};
use futures::future::join_all;
use recon_core::common::{OrchestratorError, ScanJobId, StoreError};
use recon_core::kernel::jobs::{JobRef, JobStatus};
use std::time::Duration;
use test_context::test_context;

#[test_context(TestHarness)]
#[tokio::test]
async fn concurrent_claims_grant_exactly_one_winner(ctx: &TestHarness) {
    let gateway = ctx.gateway();
    let job = create_scan_job(&gateway, unique_ip()).await;
    let job_ref = JobRef::Scan(job.id);

    let attempts = (0..8).map(|i| {
        let gateway = gateway.clone();
        async move { gateway.claim_job(job_ref, &format!("worker-{}", i)).await }
    });
    let results = join_all(attempts).await;

    let winners: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    assert_eq!(winners.len(), 1, "exactly one claim must succeed: {:?}", results);
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(
            matches!(result, Err(StoreError::ConstraintViolation(_))),
            "losers see an illegal transition, got {:?}",
            result
        );
    }

    let stored = gateway.get_job(job_ref).await.unwrap().unwrap();
    assert_eq!(stored.status(), JobStatus::Running);
    let scan = stored.as_scan().unwrap();
    assert!(scan.started_at.is_some());
    assert!(scan.claimed_by.as_deref().unwrap().starts_with("worker-"));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn concurrent_start_job_runs_once(ctx: &TestHarness) {
    let orchestrator = ctx.orchestrator(test_worker_config());
    let gateway = ctx.gateway();
    let job = create_scan_job(&gateway, unique_ip()).await;
    let job_ref = JobRef::Scan(job.id);

    let (a, b) = tokio::join!(orchestrator.start_job(job_ref), orchestrator.start_job(job_ref));

    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(OrchestratorError::InvalidState(_)))));

    let finished = wait_for_terminal(&gateway, job_ref, Duration::from_secs(10)).await;
    assert_eq!(finished.status(), JobStatus::Completed);
    assert_eq!(ctx.scan_probe().call_count(), 1);

    orchestrator.workers().shutdown().await;
}

#[test_context(TestHarness)]
#[tokio::test]
async fn claiming_a_missing_job_is_not_found(ctx: &TestHarness) {
    let gateway = ctx.gateway();
    let err = gateway
        .claim_job(JobRef::Scan(ScanJobId::new()), "worker-a")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn running_job_cannot_be_claimed_again(ctx: &TestHarness) {
    let gateway = ctx.gateway();
    let job = create_scan_job(&gateway, unique_ip()).await;
    let job_ref = JobRef::Scan(job.id);

    gateway.claim_job(job_ref, "worker-a").await.unwrap();
    let err = gateway.claim_job(job_ref, "worker-b").await.unwrap_err();

    assert!(matches!(err, StoreError::ConstraintViolation(_)));
    let stored = gateway.get_job(job_ref).await.unwrap().unwrap();
    assert_eq!(stored.as_scan().unwrap().claimed_by.as_deref(), Some("worker-a"));
}
