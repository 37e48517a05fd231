//! Orchestrator - the calls the API layer, CLI, and scheduler tick use.
//!
//! Thin on purpose: validation, then the persistence gateway for anything
//! that changes state, then the worker pool for execution. Everything is
//! constructed explicitly and passed in; there is no process-wide instance.

use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::jobs::{Job, JobEvent, JobKind, JobRef, JobStatus, WorkerPool};
use super::notifications::notify;
use super::ServerKernel;
use crate::common::{
    HostId, OrchestratorError, OrchestratorResult, ScanJobId, ScheduleId,
};
use crate::domains::discovery::models::{DiscoveryJob, NewDiscoveryJob};
use crate::domains::hosts::models::Host;
use crate::domains::profiles::models::{NewScanProfile, ScanProfile};
use crate::domains::scans::models::{NewScanJob, PortScan, ScanJob};
use crate::domains::schedules::models::{NewSchedule, Schedule};
use crate::domains::schedules::{Scheduler, SchedulerConfig};

pub struct Orchestrator {
    kernel: Arc<ServerKernel>,
    workers: Arc<WorkerPool>,
    scheduler: Scheduler,
}

impl Orchestrator {
    pub fn new(
        kernel: Arc<ServerKernel>,
        workers: Arc<WorkerPool>,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        let scheduler = Scheduler::new(kernel.gateway.clone(), scheduler_config);
        Self {
            kernel,
            workers,
            scheduler,
        }
    }

    pub fn kernel(&self) -> &Arc<ServerKernel> {
        &self.kernel
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    pub async fn create_scan_job(&self, new: NewScanJob) -> OrchestratorResult<ScanJob> {
        new.validate()?;
        if let Some(profile_id) = new.profile_id.as_deref() {
            if self.kernel.gateway.get_scan_profile(profile_id).await?.is_none() {
                return Err(OrchestratorError::Validation(format!(
                    "unknown scan profile '{}'",
                    profile_id
                )));
            }
        }
        let job = self.kernel.gateway.create_scan_job(&new).await?;
        info!(job_id = %job.id, targets = job.targets.len(), "scan job created");
        Ok(job)
    }

    pub async fn create_discovery_job(
        &self,
        new: NewDiscoveryJob,
    ) -> OrchestratorResult<DiscoveryJob> {
        let (network, method) = new.validate()?;
        let job = self
            .kernel
            .gateway
            .create_discovery_job(network, method, &new)
            .await?;
        info!(job_id = %job.id, %network, %method, "discovery job created");
        Ok(job)
    }

    /// Claims `job` for this pool and queues it for execution.
    ///
    /// Exactly one of any number of concurrent callers succeeds; the others
    /// get `InvalidState` because the job is no longer pending.
    pub async fn start_job(&self, job: JobRef) -> OrchestratorResult<Job> {
        let claimed = self
            .kernel
            .gateway
            .claim_job(job, self.workers.worker_id())
            .await?;
        info!(%job, worker_id = %self.workers.worker_id(), "job claimed");
        notify(self.kernel.notifications.as_ref(), JobEvent::claimed(job));

        self.workers.submit(claimed.clone()).await?;
        Ok(claimed)
    }

    /// Cancels a pending or running job. A running job's local execution,
    /// if this pool has one, is signalled after the row transition commits.
    pub async fn cancel_job(&self, job: JobRef) -> OrchestratorResult<Job> {
        let cancelled = self.kernel.gateway.cancel_job(job).await?;
        let signalled = self.workers.cancel_local(job);
        info!(%job, signalled, "job cancelled");
        notify(
            self.kernel.notifications.as_ref(),
            JobEvent::cancelled(job, cancelled.progress()),
        );
        Ok(cancelled)
    }

    pub async fn get_job(&self, job: JobRef) -> OrchestratorResult<Job> {
        self.kernel
            .gateway
            .get_job(job)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(job.to_string()))
    }

    pub async fn list_jobs_by_status(
        &self,
        kind: Option<JobKind>,
        status: JobStatus,
        limit: i64,
    ) -> OrchestratorResult<Vec<Job>> {
        check_page(limit, 0)?;
        Ok(self
            .kernel
            .gateway
            .list_jobs_by_status(kind, status, limit)
            .await?)
    }

    // =========================================================================
    // Schedules
    // =========================================================================

    pub async fn create_schedule(&self, new: NewSchedule) -> OrchestratorResult<Schedule> {
        let cron = new.validate()?;
        let schedule = self
            .kernel
            .gateway
            .create_schedule(&new, &cron, Utc::now())
            .await?;
        info!(
            schedule_id = %schedule.id,
            name = %schedule.name,
            cron = %schedule.cron_expression,
            "schedule created"
        );
        Ok(schedule)
    }

    pub async fn list_schedules(&self) -> OrchestratorResult<Vec<Schedule>> {
        Ok(self.kernel.gateway.list_schedules().await?)
    }

    pub async fn set_schedule_enabled(
        &self,
        id: ScheduleId,
        enabled: bool,
    ) -> OrchestratorResult<Schedule> {
        self.kernel
            .gateway
            .set_schedule_enabled(id, enabled, Utc::now())
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("schedule {}", id)))
    }

    pub async fn delete_schedule(&self, id: ScheduleId) -> OrchestratorResult<bool> {
        Ok(self.kernel.gateway.delete_schedule(id).await?)
    }

    pub async fn evaluate_schedules_once(&self) -> OrchestratorResult<Vec<Job>> {
        self.evaluate_schedules_at(Utc::now()).await
    }

    /// Fires every schedule due at `now` and starts the jobs it created.
    /// Returns the created jobs as they were when created.
    pub async fn evaluate_schedules_at(&self, now: DateTime<Utc>) -> OrchestratorResult<Vec<Job>> {
        let created = self.scheduler.evaluate_once(now).await?;
        for job in &created {
            match self.start_job(job.job_ref()).await {
                Ok(_) => {}
                // Already claimed by a polling worker.
                Err(OrchestratorError::InvalidState(reason)) => {
                    debug!(job = %job.job_ref(), %reason, "scheduled job already started")
                }
                Err(e) => warn!(job = %job.job_ref(), error = %e, "failed to start scheduled job"),
            }
        }
        Ok(created)
    }

    // =========================================================================
    // Scan profiles
    // =========================================================================

    pub async fn create_scan_profile(&self, new: NewScanProfile) -> OrchestratorResult<ScanProfile> {
        new.validate()?;
        let profile = self.kernel.gateway.create_scan_profile(&new).await?;
        info!(profile_id = %profile.id, ports = %profile.ports, "scan profile created");
        Ok(profile)
    }

    pub async fn get_scan_profile(&self, id: &str) -> OrchestratorResult<ScanProfile> {
        self.kernel
            .gateway
            .get_scan_profile(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("scan profile {}", id)))
    }

    pub async fn list_scan_profiles(&self) -> OrchestratorResult<Vec<ScanProfile>> {
        Ok(self.kernel.gateway.list_scan_profiles().await?)
    }

    /// Built-in profiles cannot be deleted.
    pub async fn delete_scan_profile(&self, id: &str) -> OrchestratorResult<()> {
        let profile = self.get_scan_profile(id).await?;
        if profile.built_in {
            return Err(OrchestratorError::InvalidState(format!(
                "scan profile {} is built in",
                id
            )));
        }
        if !self.kernel.gateway.delete_scan_profile(id).await? {
            return Err(OrchestratorError::NotFound(format!("scan profile {}", id)));
        }
        info!(profile_id = %id, "scan profile deleted");
        Ok(())
    }

    /// The profile best suited to `host_id`, judged by its detected OS
    /// family.
    pub async fn recommend_scan_profile(&self, host_id: HostId) -> OrchestratorResult<ScanProfile> {
        let host = self.get_host(host_id).await?;
        self.kernel
            .gateway
            .select_scan_profile(host.os_family.as_deref())
            .await?
            .ok_or_else(|| OrchestratorError::NotFound("scan profile".to_string()))
    }

    // =========================================================================
    // Hosts and results
    // =========================================================================

    pub async fn get_host(&self, id: HostId) -> OrchestratorResult<Host> {
        self.kernel
            .gateway
            .get_host(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("host {}", id)))
    }

    pub async fn find_host_by_ip(&self, ip: IpAddr) -> OrchestratorResult<Option<Host>> {
        Ok(self.kernel.gateway.find_host_by_ip(ip).await?)
    }

    pub async fn list_hosts(&self, limit: i64, offset: i64) -> OrchestratorResult<Vec<Host>> {
        check_page(limit, offset)?;
        Ok(self.kernel.gateway.list_hosts(limit, offset).await?)
    }

    pub async fn list_port_scans_for_job(&self, job_id: ScanJobId) -> OrchestratorResult<Vec<PortScan>> {
        Ok(self.kernel.gateway.list_port_scans_for_job(job_id).await?)
    }

    pub async fn list_port_scans_for_host(&self, host_id: HostId) -> OrchestratorResult<Vec<PortScan>> {
        Ok(self.kernel.gateway.list_port_scans_for_host(host_id).await?)
    }

    pub async fn delete_host(&self, id: HostId) -> OrchestratorResult<bool> {
        Ok(self.kernel.gateway.delete_host(id).await?)
    }

    pub async fn delete_scan_job(&self, id: ScanJobId) -> OrchestratorResult<bool> {
        Ok(self.kernel.gateway.delete_scan_job(id).await?)
    }
}

/// Negative paging values are caller errors; oversized limits are capped by
/// the gateway.
fn check_page(limit: i64, offset: i64) -> OrchestratorResult<()> {
    if limit < 0 || offset < 0 {
        return Err(OrchestratorError::Validation(format!(
            "limit and offset must not be negative (got limit {}, offset {})",
            limit, offset
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::persistence::MAX_PAGE_SIZE;

    #[test]
    fn negative_paging_is_rejected() {
        assert!(matches!(check_page(-1, 0), Err(OrchestratorError::Validation(_))));
        assert!(matches!(check_page(10, -5), Err(OrchestratorError::Validation(_))));
        assert!(check_page(0, 0).is_ok());
        assert!(check_page(MAX_PAGE_SIZE * 10, 3).is_ok());
    }
}
