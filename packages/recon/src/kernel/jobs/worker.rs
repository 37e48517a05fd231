//! Bounded worker pool for scan and discovery jobs.
//!
//! ```text
//! StartJob ──claim──► submit ──► bounded queue ──► dispatcher ──► N job tasks
//!                                     ▲                              │
//! poll loop ──claim SKIP LOCKED───────┘            probe ◄───────────┤
//!                                                 gateway ◄──────────┘
//! ```
//!
//! Jobs arrive already claimed (`running`). Each runs under its own
//! cancellation token, a child of the pool's shutdown token, racing the
//! probe against cancellation and the job timeout. The registry of running
//! job tokens is advisory: the database row is the authority on who owns a
//! job and every terminal write is conditional on the row still being
//! `running`. Heartbeats run both ways: they keep the lease fresh, and a
//! heartbeat that finds the row no longer running stops the local task.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::events::{progress, JobEvent};
use super::job::{Job, JobKind, JobRef};
use crate::common::{HostId, OrchestratorError, OrchestratorResult};
use crate::domains::discovery::models::DiscoveryJob;
use crate::domains::hosts::models::HostSighting;
use crate::domains::scans::models::{NewPortScan, ScanJob};
use crate::kernel::notifications::notify;
use crate::kernel::traits::{ProbeError, ScanOptions};
use crate::kernel::ServerKernel;

pub const SHUTDOWN_REASON: &str = "shutdown: worker pool stopped before the job finished";
pub const TIMEOUT_REASON: &str = "execution timed out";

/// How long cancelled jobs get to record their own failure before the pool
/// marks them itself.
const CANCEL_SETTLE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum concurrently executing jobs.
    pub pool_size: usize,
    /// Claimed jobs waiting for a free slot.
    pub queue_capacity: usize,
    /// Also claim pending jobs from the database, not just pushed ones.
    pub poll_pending: bool,
    pub min_poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub job_timeout: Duration,
    pub shutdown_grace: Duration,
    pub heartbeat_interval: Duration,
    /// Running jobs without a heartbeat for this long are failed.
    pub stale_after: Duration,
    pub worker_id: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_capacity: 64,
            poll_pending: true,
            min_poll_interval: Duration::from_millis(250),
            max_poll_interval: Duration::from_secs(5),
            job_timeout: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            stale_after: Duration::from_secs(120),
            worker_id: format!("worker-{}", Uuid::now_v7()),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Point-in-time counters. Observability only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub queued: u64,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every in-flight job finished within the grace period.
    pub drained: bool,
    /// Jobs still running when the grace period ran out.
    pub interrupted: Vec<JobRef>,
    /// Jobs whose tasks ignored cancellation and were left behind.
    pub abandoned: Vec<JobRef>,
}

enum Outcome {
    Completed,
    Failed(String),
    Interrupted,
}

type Registry = Arc<RwLock<HashMap<JobRef, CancellationToken>>>;

/// Removes a job from the registry when its task ends, panics included.
struct Registration {
    registry: Registry,
    job: JobRef,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.job);
    }
}

pub struct WorkerPool {
    kernel: Arc<ServerKernel>,
    config: WorkerPoolConfig,
    dispatch_tx: mpsc::Sender<Job>,
    dispatch_rx: Mutex<Option<mpsc::Receiver<Job>>>,
    slots: Arc<Semaphore>,
    /// Stops the dispatcher and poller from taking more work.
    admission: CancellationToken,
    /// Parent of every job token; cancelled when the grace period runs out.
    shutdown: CancellationToken,
    tracker: TaskTracker,
    running: Registry,
    counters: Counters,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(kernel: Arc<ServerKernel>, config: WorkerPoolConfig) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.queue_capacity.max(1));
        Arc::new(Self {
            kernel,
            slots: Arc::new(Semaphore::new(config.pool_size.max(1))),
            config,
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            admission: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            running: Arc::new(RwLock::new(HashMap::new())),
            counters: Counters::default(),
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Spawns the dispatcher and the stale-job reaper, plus the poll loop
    /// when enabled. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(rx) = self
            .dispatch_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            warn!(worker_id = %self.config.worker_id, "worker pool already started");
            return;
        };

        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        loops.push(tokio::spawn(self.clone().dispatch_loop(rx)));
        loops.push(tokio::spawn(self.clone().reap_loop()));
        if self.config.poll_pending {
            loops.push(tokio::spawn(self.clone().poll_loop()));
        }

        info!(
            worker_id = %self.config.worker_id,
            pool_size = self.config.pool_size,
            poll_pending = self.config.poll_pending,
            "worker pool started"
        );
    }

    /// Queues an already-claimed job for execution. If the pool is no
    /// longer admitting work the job is failed so it is not left running.
    pub async fn submit(&self, job: Job) -> OrchestratorResult<()> {
        let permit = tokio::select! {
            biased;
            _ = self.admission.cancelled() => None,
            permit = self.dispatch_tx.reserve() => permit.ok(),
        };

        match permit {
            Some(permit) => {
                debug!(job = %job.job_ref(), "job queued");
                permit.send(job);
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => {
                self.fail(job.job_ref(), SHUTDOWN_REASON).await;
                Err(OrchestratorError::Unavailable(
                    "worker pool is shutting down".to_string(),
                ))
            }
        }
    }

    /// Signals the local execution of `job`, if any. Returns whether a
    /// running task was found.
    pub fn cancel_local(&self, job: JobRef) -> bool {
        let running = self.running.read().unwrap_or_else(|e| e.into_inner());
        match running.get(&job) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_jobs(&self) -> Vec<JobRef> {
        self.running
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            active: self.running.read().unwrap_or_else(|e| e.into_inner()).len(),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Stops admitting work, waits up to the grace period for in-flight
    /// jobs, then cancels the rest and marks them failed with a shutdown
    /// reason. Queued jobs that never started are failed the same way.
    pub async fn shutdown(&self) -> ShutdownReport {
        let grace = self.config.shutdown_grace;
        info!(
            worker_id = %self.config.worker_id,
            grace_ms = grace.as_millis() as u64,
            active = self.active_jobs().len(),
            "worker pool shutting down"
        );

        self.admission.cancel();
        let loops = std::mem::take(&mut *self.loops.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "worker pool loop panicked");
            }
        }

        self.tracker.close();
        let mut report = ShutdownReport::default();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            report.drained = true;
            info!(worker_id = %self.config.worker_id, "worker pool drained");
            return report;
        }

        report.interrupted = self.active_jobs();
        warn!(
            count = report.interrupted.len(),
            "grace period elapsed, cancelling in-flight jobs"
        );
        self.shutdown.cancel();

        if tokio::time::timeout(CANCEL_SETTLE, self.tracker.wait()).await.is_err() {
            report.abandoned = self.active_jobs();
            for job in &report.abandoned {
                warn!(%job, "job task ignored cancellation, abandoning it");
                self.fail(*job, SHUTDOWN_REASON).await;
            }
        }

        info!(
            worker_id = %self.config.worker_id,
            interrupted = report.interrupted.len(),
            abandoned = report.abandoned.len(),
            "worker pool stopped"
        );
        report
    }

    // =========================================================================
    // Loops
    // =========================================================================

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Job>) {
        loop {
            let job = tokio::select! {
                biased;
                _ = self.admission.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let permit = tokio::select! {
                biased;
                _ = self.admission.cancelled() => {
                    self.fail(job.job_ref(), SHUTDOWN_REASON).await;
                    break;
                }
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.fail(job.job_ref(), SHUTDOWN_REASON).await;
                        break;
                    }
                },
            };

            let job_ref = job.job_ref();
            let token = self.shutdown.child_token();
            self.running
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(job_ref, token.clone());
            let registration = Registration {
                registry: self.running.clone(),
                job: job_ref,
            };

            let pool = self.clone();
            let span = info_span!("job", job_id = %job_ref.uuid(), kind = %job_ref.kind());
            self.tracker.spawn(
                async move {
                    let _permit = permit;
                    let _registration = registration;
                    pool.run_job(job, token).await;
                }
                .instrument(span),
            );
        }

        rx.close();
        while let Ok(job) = rx.try_recv() {
            self.fail(job.job_ref(), SHUTDOWN_REASON).await;
        }
        debug!("dispatcher stopped");
    }

    async fn poll_loop(self: Arc<Self>) {
        let min = self.config.min_poll_interval;
        let max = self.config.max_poll_interval.max(min);
        let mut interval = min;

        loop {
            tokio::select! {
                biased;
                _ = self.admission.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let capacity = self.dispatch_tx.capacity().min(self.config.pool_size.max(1)) as i64;
            let mut claimed = 0;
            if capacity > 0 {
                for kind in [JobKind::Scan, JobKind::Discovery] {
                    if claimed >= capacity {
                        break;
                    }
                    let jobs = match self
                        .kernel
                        .gateway
                        .claim_next_pending(kind, &self.config.worker_id, capacity - claimed)
                        .await
                    {
                        Ok(jobs) => jobs,
                        Err(e) => {
                            error!(%kind, error = %e, "failed to claim pending jobs");
                            continue;
                        }
                    };
                    for job in jobs {
                        claimed += 1;
                        info!(job = %job.job_ref(), "claimed pending job");
                        notify(
                            self.kernel.notifications.as_ref(),
                            JobEvent::claimed(job.job_ref()),
                        );
                        if let Err(e) = self.submit(job).await {
                            warn!(error = %e, "could not queue claimed job");
                        }
                    }
                }
            }

            interval = if claimed > 0 { min } else { (interval * 2).min(max) };
        }
        debug!("poll loop stopped");
    }

    /// Fails jobs orphaned by crashed workers, whether or not this pool
    /// polls for pending work.
    async fn reap_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.admission.cancelled() => break,
                _ = interval.tick() => self.reap_stale_jobs().await,
            }
        }
        debug!("reaper stopped");
    }

    async fn reap_stale_jobs(&self) {
        for kind in [JobKind::Scan, JobKind::Discovery] {
            match self
                .kernel
                .gateway
                .reap_stale_jobs(kind, self.config.stale_after)
                .await
            {
                Ok(jobs) => {
                    for job in jobs {
                        let job_ref = job.job_ref();
                        warn!(job = %job_ref, "worker lease expired, job failed");
                        self.cancel_local(job_ref);
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        notify(
                            self.kernel.notifications.as_ref(),
                            JobEvent::failed(
                                job_ref,
                                job.progress(),
                                job.error_message().unwrap_or_default(),
                            ),
                        );
                    }
                }
                Err(e) => error!(%kind, error = %e, "failed to reap stale jobs"),
            }
        }
    }

    // =========================================================================
    // Job execution
    // =========================================================================

    async fn run_job(&self, job: Job, token: CancellationToken) {
        let job_ref = job.job_ref();
        debug!("job started");

        let heartbeat_stop = token.child_token();
        let heartbeat = self.spawn_heartbeat(job_ref, token.clone(), heartbeat_stop.clone());

        let outcome = match &job {
            Job::Scan(scan) => self.execute_scan(scan, &token).await,
            Job::Discovery(discovery) => self.execute_discovery(discovery, &token).await,
        };

        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        match outcome {
            Outcome::Completed => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!("job completed");
                notify(self.kernel.notifications.as_ref(), JobEvent::completed(job_ref));
            }
            Outcome::Failed(reason) => self.fail(job_ref, &reason).await,
            Outcome::Interrupted if self.shutdown.is_cancelled() => {
                self.fail(job_ref, SHUTDOWN_REASON).await
            }
            Outcome::Interrupted if token.is_cancelled() => {
                // The row already left running: CancelJob here or in another
                // process, or the stale-job reaper.
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                info!("job cancelled, results discarded");
            }
            Outcome::Interrupted => self.fail(job_ref, "probe cancelled itself").await,
        }
    }

    /// Refreshes `heartbeat_at` until `stop`. A heartbeat that finds the row
    /// no longer running cancels `token`, which is how a job cancelled or
    /// reaped by another process is stopped here.
    fn spawn_heartbeat(
        &self,
        job: JobRef,
        token: CancellationToken,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let gateway = self.kernel.gateway.clone();
        let every = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => match gateway.heartbeat(job).await {
                        Ok(true) => {}
                        Ok(false) => {
                            info!(%job, "job is no longer running, stopping it");
                            token.cancel();
                            break;
                        }
                        Err(e) => warn!(%job, error = %e, "heartbeat failed"),
                    },
                }
            }
        })
    }

    async fn execute_scan(&self, scan: &ScanJob, token: &CancellationToken) -> Outcome {
        let job_ref = JobRef::Scan(scan.id);
        let options = match scan.port_list() {
            Ok(ports) => ScanOptions {
                ports,
                scan_type: scan.scan_type.clone(),
                profile_id: scan.profile_id.clone(),
            },
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        self.checkpoint(job_ref, progress::PROBE_STARTED, "probe started").await;
        let probe = self.kernel.scan_probe.clone();
        let probe_token = token.child_token();
        let results = match self
            .await_probe(
                job_ref,
                token,
                &probe_token,
                probe.execute(probe_token.clone(), &scan.targets, &options),
            )
            .await
        {
            Ok(results) => results,
            Err(outcome) => return outcome,
        };
        self.checkpoint(
            job_ref,
            progress::PROBE_FINISHED,
            format!("probe returned {} results", results.len()),
        )
        .await;

        let seen_at = Utc::now();
        let mut sightings: BTreeMap<IpAddr, HostSighting> = BTreeMap::new();
        for result in &results {
            let sighting = sightings.entry(result.ip).or_insert_with(|| {
                HostSighting::builder()
                    .ip(result.ip)
                    .discovered_by("scan")
                    .seen_at(seen_at)
                    .build()
            });
            if sighting.hostname.is_none() {
                sighting.hostname = result.hostname.clone();
            }
        }
        let sightings: Vec<HostSighting> = sightings.into_values().collect();

        let hosts = match self.kernel.gateway.upsert_hosts(&sightings).await {
            Ok(hosts) => hosts,
            Err(e) => return Outcome::Failed(format!("failed to record hosts: {}", e)),
        };
        let host_ids: HashMap<IpAddr, HostId> = hosts.iter().map(|h| (h.ip(), h.id)).collect();
        let rows: Vec<NewPortScan> = results
            .iter()
            .filter_map(|r| host_ids.get(&r.ip).map(|id| NewPortScan::from_result(*id, r)))
            .collect();
        self.checkpoint(job_ref, progress::RESULTS_PERSISTED, "hosts recorded").await;

        if token.is_cancelled() {
            return Outcome::Interrupted;
        }
        match self.kernel.gateway.complete_scan_job(scan.id, &rows).await {
            Ok(_) => Outcome::Completed,
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }

    async fn execute_discovery(&self, job: &DiscoveryJob, token: &CancellationToken) -> Outcome {
        let job_ref = JobRef::Discovery(job.id);
        let method = match job.method() {
            Ok(method) => method,
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        self.checkpoint(job_ref, progress::PROBE_STARTED, "probe started").await;
        let probe = self.kernel.discovery_probe.clone();
        let probe_token = token.child_token();
        let found = match self
            .await_probe(
                job_ref,
                token,
                &probe_token,
                probe.discover(probe_token.clone(), job.network, method),
            )
            .await
        {
            Ok(found) => found,
            Err(outcome) => return outcome,
        };
        self.checkpoint(
            job_ref,
            progress::PROBE_FINISHED,
            format!("{} live hosts found", found.len()),
        )
        .await;

        if token.is_cancelled() {
            return Outcome::Interrupted;
        }
        let seen_at = Utc::now();
        let sightings: Vec<HostSighting> = found
            .into_iter()
            .map(|host| host.into_sighting(job.id, method, seen_at))
            .collect();
        match self.kernel.gateway.complete_discovery_job(job.id, &sightings).await {
            Ok(_) => Outcome::Completed,
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }

    /// Races a probe against the job token and the job timeout. Dropping the
    /// probe future is the backstop for probes that ignore their token.
    async fn await_probe<T>(
        &self,
        job: JobRef,
        token: &CancellationToken,
        probe_token: &CancellationToken,
        probe: impl Future<Output = Result<Vec<T>, ProbeError>>,
    ) -> Result<Vec<T>, Outcome> {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = tokio::time::timeout(self.config.job_timeout, probe) => Some(result),
        };
        probe_token.cancel();

        match result {
            None => Err(Outcome::Interrupted),
            Some(Err(_elapsed)) => {
                warn!(%job, timeout_secs = self.config.job_timeout.as_secs(), "probe exceeded job timeout");
                Err(Outcome::Failed(TIMEOUT_REASON.to_string()))
            }
            Some(Ok(Ok(results))) => Ok(results),
            Some(Ok(Err(e))) => {
                if e.partial() > 0 {
                    info!(%job, partial = e.partial(), "discarding partial probe results");
                }
                Err(match e {
                    ProbeError::Cancelled { .. } => Outcome::Interrupted,
                    ProbeError::Timeout { .. } => Outcome::Failed(TIMEOUT_REASON.to_string()),
                    ProbeError::Failed { message, .. } => Outcome::Failed(message),
                })
            }
        }
    }

    async fn checkpoint(&self, job: JobRef, progress: i32, message: impl Into<String>) {
        if let Err(e) = self.kernel.gateway.record_progress(job, progress).await {
            warn!(%job, progress, error = %e, "failed to record progress");
        }
        notify(
            self.kernel.notifications.as_ref(),
            JobEvent::progress(job, progress, message),
        );
    }

    /// running → failed. A job that already reached a terminal state keeps
    /// it; a store failure leaves the row for the stale-job reaper.
    async fn fail(&self, job: JobRef, reason: &str) {
        match self.kernel.gateway.fail_job(job, reason).await {
            Ok(Some(failed)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(%job, reason, "job failed");
                notify(
                    self.kernel.notifications.as_ref(),
                    JobEvent::failed(job, failed.progress(), reason),
                );
            }
            Ok(None) => debug!(%job, reason, "job already terminal, outcome discarded"),
            Err(e) => error!(%job, error = %e, "failed to record job failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
        assert!(config.poll_pending);
        assert!(config.worker_id.starts_with("worker-"));
    }

    #[test]
    fn config_with_worker_id() {
        let config = WorkerPoolConfig::with_worker_id("recond-a");
        assert_eq!(config.worker_id, "recond-a");
        assert_eq!(config.pool_size, 4);
    }

    #[test]
    fn registration_removes_job_on_drop() {
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
        let job = JobRef::Scan(crate::common::ScanJobId::new());
        registry
            .write()
            .unwrap()
            .insert(job, CancellationToken::new());
        drop(Registration {
            registry: registry.clone(),
            job,
        });
        assert!(registry.read().unwrap().is_empty());
    }
}
