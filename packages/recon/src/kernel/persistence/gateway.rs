//! Persistence gateway.
//!
//! The single entry point for job, host, and result writes. Every
//! multi-row write runs in one transaction with an explicit isolation
//! level, takes the consistency guard's row locks on every parent it
//! references, and either commits everything or nothing. Each public
//! operation is wrapped in the retry policy, so transient failures
//! (serialization conflicts, dropped connections) re-run the whole
//! transaction from the top.

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Transaction};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

use super::guard;
use crate::common::{
    DiscoveryJobId, HostId, ScanJobId, ScheduleId, StoreError, StoreResult, ValidationError,
};
use crate::domains::discovery::models::{DiscoveryJob, DiscoveryMethod, NewDiscoveryJob};
use crate::domains::hosts::models::{Host, HostFilter, HostSighting};
use crate::domains::profiles::models::{NewScanProfile, ScanProfile};
use crate::domains::scans::models::{NewPortScan, NewScanJob, PortScan, ResolvedScan, ScanJob};
use crate::domains::schedules::cron_expr::CronExpression;
use crate::domains::schedules::models::{NewSchedule, Schedule};
use crate::kernel::jobs::{Job, JobKind, JobRef, JobRequest, JobStatus, Transition};
use crate::kernel::retry::RetryPolicy;

pub const CANCELLED_REASON: &str = "cancelled by request";
pub const LEASE_EXPIRED_REASON: &str = "worker lease expired";
/// Largest page any list read returns.
pub const MAX_PAGE_SIZE: i64 = 1_000;
/// Most hosts one host-filtered firing turns into targets.
const MAX_FILTERED_TARGETS: i64 = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    ReadCommitted,
    Serializable,
}

impl Isolation {
    fn statement(&self) -> &'static str {
        match self {
            Isolation::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            Isolation::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// `UPDATE` for a lifecycle transition, conditional on the transition's
/// source statuses. `$1` is always the job id.
fn transition_sql(kind: JobKind, transition: Transition, set: &str) -> String {
    format!(
        "UPDATE {table} SET status = '{target}', {set}, updated_at = NOW() \
         WHERE id = $1 AND status IN ({sources}) RETURNING *",
        table = kind.table(),
        target = transition.target(),
        set = set,
        sources = transition.source_list_sql(),
    )
}

fn decode_job(kind: JobKind, row: &PgRow) -> StoreResult<Job> {
    Ok(match kind {
        JobKind::Scan => Job::Scan(ScanJob::from_row(row)?),
        JobKind::Discovery => Job::Discovery(DiscoveryJob::from_row(row)?),
    })
}

fn invalid_input(err: ValidationError) -> StoreError {
    StoreError::ConstraintViolation(err.to_string())
}

#[derive(Clone)]
pub struct PersistenceGateway {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PersistenceGateway {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    async fn begin(pool: &PgPool, isolation: Isolation) -> StoreResult<Transaction<'static, Postgres>> {
        let mut tx = pool.begin().await?;
        sqlx::query(isolation.statement()).execute(&mut *tx).await?;
        Ok(tx)
    }

    async fn current_status(job: JobRef, conn: &mut PgConnection) -> StoreResult<Option<JobStatus>> {
        let sql = format!("SELECT status FROM {} WHERE id = $1", job.kind().table());
        sqlx::query_scalar(&sql)
            .bind(job.uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(Into::into)
    }

    // =========================================================================
    // Job creation
    // =========================================================================

    /// Inserts a pending scan job. The request must already be validated.
    pub async fn create_scan_job(&self, new: &NewScanJob) -> StoreResult<ScanJob> {
        let pool = &self.pool;
        self.retry
            .run("create_scan_job", move || async move {
                let mut tx = Self::begin(pool, Isolation::ReadCommitted).await?;
                let resolved = Self::resolve_scan(new, &mut *tx).await?;
                let job = ScanJob::insert(new, &resolved, &mut *tx).await?;
                tx.commit().await?;
                Ok(job)
            })
            .await
    }

    pub async fn create_discovery_job(
        &self,
        network: IpNetwork,
        method: DiscoveryMethod,
        new: &NewDiscoveryJob,
    ) -> StoreResult<DiscoveryJob> {
        let pool = &self.pool;
        self.retry
            .run("create_discovery_job", move || async move {
                let mut tx = Self::begin(pool, Isolation::ReadCommitted).await?;
                let job = DiscoveryJob::insert(network, method, new, &mut *tx).await?;
                tx.commit().await?;
                Ok(job)
            })
            .await
    }

    /// Applies the referenced profile's defaults. The profile is read in
    /// the writing transaction; the foreign key keeps it from vanishing
    /// before commit.
    async fn resolve_scan(new: &NewScanJob, conn: &mut PgConnection) -> StoreResult<ResolvedScan> {
        let profile = match new.profile_id.as_deref() {
            Some(id) => Some(
                ScanProfile::find_by_id(id, &mut *conn)
                    .await?
                    .ok_or_else(|| StoreError::foreign_key_missing("scan_profiles", std::iter::empty()))?,
            ),
            None => None,
        };
        new.resolve(profile.as_ref()).map_err(invalid_input)
    }

    async fn insert_job_request(request: &JobRequest, conn: &mut PgConnection) -> StoreResult<Job> {
        match request {
            JobRequest::Scan(new) => {
                new.validate().map_err(invalid_input)?;
                let resolved = Self::resolve_scan(new, &mut *conn).await?;
                Ok(Job::Scan(ScanJob::insert(new, &resolved, conn).await?))
            }
            JobRequest::Discovery(new) => {
                let (network, method) = new.validate().map_err(invalid_input)?;
                Ok(Job::Discovery(
                    DiscoveryJob::insert(network, method, new, conn).await?,
                ))
            }
        }
    }

    // =========================================================================
    // Lifecycle transitions
    // =========================================================================

    /// pending → running, exactly once.
    ///
    /// Runs SERIALIZABLE so two racing claimers cannot both observe
    /// `pending`; the loser either matches zero rows or aborts with a
    /// serialization failure, retries, and then matches zero rows. Zero rows
    /// surfaces as `ConstraintViolation` (or `NotFound` if the row is gone).
    pub async fn claim_job(&self, job: JobRef, worker_id: &str) -> StoreResult<Job> {
        let pool = &self.pool;
        self.retry
            .run("claim_job", move || async move {
                let mut tx = Self::begin(pool, Isolation::Serializable).await?;
                let sql = transition_sql(
                    job.kind(),
                    Transition::Claim,
                    "started_at = NOW(), claimed_by = $2, heartbeat_at = NOW(), progress = 0",
                );
                let row = sqlx::query(&sql)
                    .bind(job.uuid())
                    .bind(worker_id)
                    .fetch_optional(&mut *tx)
                    .await?;

                match row {
                    Some(row) => {
                        let claimed = decode_job(job.kind(), &row)?;
                        tx.commit().await?;
                        Ok(claimed)
                    }
                    None => {
                        let current = Self::current_status(job, &mut *tx).await?;
                        tx.rollback().await?;
                        Err(match current {
                            Some(status) => guard::illegal_transition(job, status, Transition::Claim),
                            None => StoreError::NotFound(job.to_string()),
                        })
                    }
                }
            })
            .await
    }

    /// Claims up to `limit` pending jobs of `kind`, skipping rows another
    /// claimer already holds.
    pub async fn claim_next_pending(
        &self,
        kind: JobKind,
        worker_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<Job>> {
        let pool = &self.pool;
        let table = kind.table();
        let sql = format!(
            r#"
            WITH next AS (
                SELECT id FROM {table}
                WHERE status = 'pending'
                ORDER BY created_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table}
            SET status = 'running', started_at = NOW(), claimed_by = $1,
                heartbeat_at = NOW(), progress = 0, updated_at = NOW()
            FROM next
            WHERE {table}.id = next.id AND {table}.status = 'pending'
            RETURNING {table}.*
            "#
        );
        let sql = sql.as_str();

        self.retry
            .run("claim_next_pending", move || async move {
                let mut tx = Self::begin(pool, Isolation::ReadCommitted).await?;
                let rows = sqlx::query(sql)
                    .bind(worker_id)
                    .bind(limit)
                    .fetch_all(&mut *tx)
                    .await?;
                let jobs = rows
                    .iter()
                    .map(|row| decode_job(kind, row))
                    .collect::<StoreResult<Vec<_>>>()?;
                tx.commit().await?;
                Ok(jobs)
            })
            .await
    }

    /// running → failed. Returns `None` when the job was no longer running,
    /// leaving terminal rows untouched.
    pub async fn fail_job(&self, job: JobRef, reason: &str) -> StoreResult<Option<Job>> {
        let pool = &self.pool;
        let sql = transition_sql(
            job.kind(),
            Transition::Fail,
            "error_message = $2, completed_at = NOW()",
        );
        let sql = sql.as_str();

        self.retry
            .run("fail_job", move || async move {
                let row = sqlx::query(sql)
                    .bind(job.uuid())
                    .bind(reason)
                    .fetch_optional(pool)
                    .await?;
                row.map(|row| decode_job(job.kind(), &row)).transpose()
            })
            .await
    }

    /// pending|running → cancelled.
    pub async fn cancel_job(&self, job: JobRef) -> StoreResult<Job> {
        let pool = &self.pool;
        let sql = transition_sql(
            job.kind(),
            Transition::Cancel,
            "error_message = $2, completed_at = NOW()",
        );
        let sql = sql.as_str();

        self.retry
            .run("cancel_job", move || async move {
                let mut tx = Self::begin(pool, Isolation::ReadCommitted).await?;
                match guard::lock_job_for(job, Transition::Cancel, &mut *tx).await {
                    Ok(_) => {}
                    Err(StoreError::ForeignKeyMissing { .. }) => {
                        return Err(StoreError::NotFound(job.to_string()))
                    }
                    Err(e) => return Err(e),
                }
                let row = sqlx::query(sql)
                    .bind(job.uuid())
                    .bind(CANCELLED_REASON)
                    .fetch_one(&mut *tx)
                    .await?;
                let cancelled = decode_job(job.kind(), &row)?;
                tx.commit().await?;
                Ok(cancelled)
            })
            .await
    }

    /// Moves progress forward on a running job. Never moves it backwards.
    pub async fn record_progress(&self, job: JobRef, progress: i32) -> StoreResult<bool> {
        let pool = &self.pool;
        let sql = format!(
            "UPDATE {} SET progress = GREATEST(progress, $2), updated_at = NOW() \
             WHERE id = $1 AND status = 'running'",
            job.kind().table()
        );
        let sql = sql.as_str();
        let progress = progress.clamp(0, 100);

        self.retry
            .run("record_progress", move || async move {
                let result = sqlx::query(sql)
                    .bind(job.uuid())
                    .bind(progress)
                    .execute(pool)
                    .await?;
                Ok(result.rows_affected() > 0)
            })
            .await
    }

    pub async fn heartbeat(&self, job: JobRef) -> StoreResult<bool> {
        let sql = format!(
            "UPDATE {} SET heartbeat_at = NOW() WHERE id = $1 AND status = 'running'",
            job.kind().table()
        );
        let result = sqlx::query(&sql).bind(job.uuid()).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fails running jobs whose heartbeat is older than `stale_after`. The
    /// jobs are not re-run.
    pub async fn reap_stale_jobs(&self, kind: JobKind, stale_after: Duration) -> StoreResult<Vec<Job>> {
        let pool = &self.pool;
        let table = kind.table();
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'failed', error_message = $1, completed_at = NOW(), updated_at = NOW()
            WHERE status = 'running'
              AND COALESCE(heartbeat_at, started_at, updated_at) < NOW() - make_interval(secs => $2)
            RETURNING *
            "#
        );
        let sql = sql.as_str();
        let secs = stale_after.as_secs_f64();

        self.retry
            .run("reap_stale_jobs", move || async move {
                let rows = sqlx::query(sql)
                    .bind(LEASE_EXPIRED_REASON)
                    .bind(secs)
                    .fetch_all(pool)
                    .await?;
                rows.iter().map(|row| decode_job(kind, row)).collect()
            })
            .await
    }

    // =========================================================================
    // Result writes
    // =========================================================================

    /// Upserts a single host sighting keyed on IP.
    pub async fn upsert_host(&self, sighting: &HostSighting) -> StoreResult<Host> {
        let pool = &self.pool;
        self.retry
            .run("upsert_host", move || async move {
                let mut tx = Self::begin(pool, Isolation::ReadCommitted).await?;
                let host = Host::upsert(sighting, &mut *tx).await?;
                tx.commit().await?;
                Ok(host)
            })
            .await
    }

    /// Upserts many sightings in one transaction, in address order.
    pub async fn upsert_hosts(&self, sightings: &[HostSighting]) -> StoreResult<Vec<Host>> {
        let pool = &self.pool;
        let mut ordered: Vec<&HostSighting> = sightings.iter().collect();
        ordered.sort_by_key(|s| s.ip);
        let ordered = ordered.as_slice();

        self.retry
            .run("upsert_hosts", move || async move {
                let mut tx = Self::begin(pool, Isolation::ReadCommitted).await?;
                let mut hosts = Vec::with_capacity(ordered.len());
                for sighting in ordered {
                    hosts.push(Host::upsert(sighting, &mut *tx).await?);
                }
                tx.commit().await?;
                Ok(hosts)
            })
            .await
    }

    /// Inserts port results for `job_id` after locking the job and every
    /// referenced host. A missing parent fails the whole batch with
    /// `ForeignKeyMissing`; nothing is written.
    pub async fn insert_port_scans(&self, job_id: ScanJobId, scans: &[NewPortScan]) -> StoreResult<u64> {
        let pool = &self.pool;
        self.retry
            .run("insert_port_scans", move || async move {
                let mut tx = Self::begin(pool, Isolation::ReadCommitted).await?;
                guard::lock_job(JobRef::Scan(job_id), &mut *tx).await?;
                let host_ids: Vec<HostId> = scans.iter().map(|s| s.host_id).collect();
                guard::lock_hosts(&host_ids, &mut *tx).await?;
                let written = PortScan::insert_batch(job_id, scans, &mut *tx).await?;
                tx.commit().await?;
                Ok(written)
            })
            .await
    }

    /// Writes a scan's results and marks it completed in one transaction.
    ///
    /// The job must still be running under the row lock; a job cancelled
    /// or failed in the meantime rejects the results with
    /// `ConstraintViolation`. Missing job or host rows fail with
    /// `ForeignKeyMissing`.
    pub async fn complete_scan_job(&self, job_id: ScanJobId, scans: &[NewPortScan]) -> StoreResult<ScanJob> {
        let pool = &self.pool;
        let job = JobRef::Scan(job_id);
        let sql = transition_sql(
            JobKind::Scan,
            Transition::Complete,
            "progress = 100, completed_at = NOW(), error_message = NULL",
        );
        let sql = sql.as_str();

        self.retry
            .run("complete_scan_job", move || async move {
                let mut tx = Self::begin(pool, Isolation::ReadCommitted).await?;
                guard::lock_job_for(job, Transition::Complete, &mut *tx).await?;
                let host_ids: Vec<HostId> = scans.iter().map(|s| s.host_id).collect();
                guard::lock_hosts(&host_ids, &mut *tx).await?;

                let written = PortScan::insert_batch(job_id, scans, &mut *tx).await?;
                let row = sqlx::query(sql).bind(job_id).fetch_one(&mut *tx).await?;
                let completed = ScanJob::from_row(&row)?;
                tx.commit().await?;

                debug!(%job_id, written, "scan results committed");
                Ok(completed)
            })
            .await
    }

    /// Records discovered hosts and marks the discovery job completed in one
    /// transaction.
    pub async fn complete_discovery_job(
        &self,
        job_id: DiscoveryJobId,
        sightings: &[HostSighting],
    ) -> StoreResult<(DiscoveryJob, Vec<Host>)> {
        let pool = &self.pool;
        let job = JobRef::Discovery(job_id);
        let sql = transition_sql(
            JobKind::Discovery,
            Transition::Complete,
            "progress = 100, hosts_discovered = $2, completed_at = NOW(), error_message = NULL",
        );
        let sql = sql.as_str();
        let mut ordered: Vec<&HostSighting> = sightings.iter().collect();
        ordered.sort_by_key(|s| s.ip);
        let ordered = ordered.as_slice();

        self.retry
            .run("complete_discovery_job", move || async move {
                let mut tx = Self::begin(pool, Isolation::ReadCommitted).await?;
                guard::lock_job_for(job, Transition::Complete, &mut *tx).await?;

                let mut hosts: Vec<Host> = Vec::with_capacity(ordered.len());
                for sighting in ordered {
                    hosts.push(Host::upsert(sighting, &mut *tx).await?);
                }
                let mut distinct: Vec<HostId> = hosts.iter().map(|h| h.id).collect();
                distinct.sort();
                distinct.dedup();

                let row = sqlx::query(sql)
                    .bind(job_id)
                    .bind(distinct.len() as i32)
                    .fetch_one(&mut *tx)
                    .await?;
                let completed = DiscoveryJob::from_row(&row)?;
                tx.commit().await?;

                debug!(%job_id, hosts = distinct.len(), "discovery results committed");
                Ok((completed, hosts))
            })
            .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get_job(&self, job: JobRef) -> StoreResult<Option<Job>> {
        let pool = &self.pool;
        self.retry
            .run("get_job", move || async move {
                Ok(match job {
                    JobRef::Scan(id) => ScanJob::find_by_id(id, pool).await?.map(Job::Scan),
                    JobRef::Discovery(id) => {
                        DiscoveryJob::find_by_id(id, pool).await?.map(Job::Discovery)
                    }
                })
            })
            .await
    }

    /// Jobs in `status`, oldest first. `kind = None` merges both kinds.
    pub async fn list_jobs_by_status(
        &self,
        kind: Option<JobKind>,
        status: JobStatus,
        limit: i64,
    ) -> StoreResult<Vec<Job>> {
        let pool = &self.pool;
        let limit = limit.clamp(0, MAX_PAGE_SIZE);
        self.retry
            .run("list_jobs_by_status", move || async move {
                let mut jobs: Vec<Job> = Vec::new();
                if kind.is_none() || kind == Some(JobKind::Scan) {
                    jobs.extend(
                        ScanJob::list_by_status(status, limit, pool)
                            .await?
                            .into_iter()
                            .map(Job::Scan),
                    );
                }
                if kind.is_none() || kind == Some(JobKind::Discovery) {
                    jobs.extend(
                        DiscoveryJob::list_by_status(status, limit, pool)
                            .await?
                            .into_iter()
                            .map(Job::Discovery),
                    );
                }
                jobs.sort_by_key(|j| (j.created_at(), j.job_ref().uuid()));
                jobs.truncate(limit as usize);
                Ok(jobs)
            })
            .await
    }

    pub async fn get_host(&self, id: HostId) -> StoreResult<Option<Host>> {
        Host::find_by_id(id, &self.pool).await
    }

    pub async fn find_host_by_ip(&self, ip: IpAddr) -> StoreResult<Option<Host>> {
        Host::find_by_ip(ip, &self.pool).await
    }

    pub async fn list_hosts(&self, limit: i64, offset: i64) -> StoreResult<Vec<Host>> {
        Host::list(limit.clamp(0, MAX_PAGE_SIZE), offset.max(0), &self.pool).await
    }

    pub async fn list_port_scans_for_job(&self, job_id: ScanJobId) -> StoreResult<Vec<PortScan>> {
        PortScan::list_for_job(job_id, &self.pool).await
    }

    pub async fn list_port_scans_for_host(&self, host_id: HostId) -> StoreResult<Vec<PortScan>> {
        PortScan::list_for_host(host_id, &self.pool).await
    }

    // =========================================================================
    // Administrative removal
    // =========================================================================

    /// Deletes a host and its port results. Waits for any in-flight guarded
    /// write holding the host's row lock.
    pub async fn delete_host(&self, id: HostId) -> StoreResult<bool> {
        let pool = &self.pool;
        self.retry
            .run("delete_host", move || async move {
                let mut tx = Self::begin(pool, Isolation::ReadCommitted).await?;
                let deleted = Host::delete(id, &mut *tx).await?;
                tx.commit().await?;
                if deleted {
                    info!(host_id = %id, "host deleted");
                }
                Ok(deleted)
            })
            .await
    }

    pub async fn delete_scan_job(&self, id: ScanJobId) -> StoreResult<bool> {
        let pool = &self.pool;
        self.retry
            .run("delete_scan_job", move || async move {
                let mut tx = Self::begin(pool, Isolation::ReadCommitted).await?;
                let deleted = ScanJob::delete(id, &mut *tx).await?;
                tx.commit().await?;
                if deleted {
                    info!(job_id = %id, "scan job deleted");
                }
                Ok(deleted)
            })
            .await
    }

    // =========================================================================
    // Schedules
    // =========================================================================

    pub async fn create_schedule(
        &self,
        new: &NewSchedule,
        cron: &CronExpression,
        now: DateTime<Utc>,
    ) -> StoreResult<Schedule> {
        let pool = &self.pool;
        let next_run = if new.enabled { cron.next_after(now) } else { None };
        self.retry
            .run("create_schedule", move || {
                Schedule::insert(new, cron, next_run, pool)
            })
            .await
    }

    pub async fn get_schedule(&self, id: ScheduleId) -> StoreResult<Option<Schedule>> {
        Schedule::find_by_id(id, &self.pool).await
    }

    pub async fn list_schedules(&self) -> StoreResult<Vec<Schedule>> {
        Schedule::list(&self.pool).await
    }

    /// Enabling recomputes `next_run` from `now`, so a long-disabled
    /// schedule does not fire for the time it was off.
    pub async fn set_schedule_enabled(
        &self,
        id: ScheduleId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Schedule>> {
        let Some(schedule) = Schedule::find_by_id(id, &self.pool).await? else {
            return Ok(None);
        };
        let next_run = if enabled {
            schedule
                .cron()
                .map_err(invalid_input)?
                .next_after(now)
        } else {
            None
        };
        Schedule::set_enabled(id, enabled, next_run, &self.pool).await
    }

    pub async fn delete_schedule(&self, id: ScheduleId) -> StoreResult<bool> {
        Schedule::delete(id, &self.pool).await
    }

    pub async fn due_schedules(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Schedule>> {
        let pool = &self.pool;
        self.retry
            .run("due_schedules", move || Schedule::find_due(now, limit, pool))
            .await
    }

    /// Claims the firing of `schedule` observed at `schedule.next_run` and
    /// creates its job, both in one transaction. Returns `None` when another
    /// evaluator already claimed this firing.
    ///
    /// Missed firings coalesce: the new `next_run` is the first occurrence
    /// after `now`, however many were skipped.
    /// Claims one firing of `schedule` and writes its job in the same
    /// transaction.
    ///
    /// `Ok(None)` means another evaluator claimed the firing first, or the
    /// schedule selects targets from `hosts` and none matched; the run
    /// pointers advance either way.
    pub async fn fire_schedule(&self, schedule: &Schedule, now: DateTime<Utc>) -> StoreResult<Option<Job>> {
        let Some(observed) = schedule.next_run else {
            return Ok(None);
        };
        let cron = schedule.cron().map_err(invalid_input)?;
        let next_run = cron.next_after(now);
        let request = schedule.config.0.job_request(schedule.id, observed);
        let request = &request;
        let filter = schedule.config.0.host_filter();
        let pool = &self.pool;
        let schedule_id = schedule.id;

        self.retry
            .run("fire_schedule", move || async move {
                let mut tx = Self::begin(pool, Isolation::ReadCommitted).await?;
                if !Schedule::claim_firing(schedule_id, observed, now, next_run, &mut *tx).await? {
                    tx.rollback().await?;
                    return Ok(None);
                }
                let mut request = request.clone();
                if let (Some(filter), JobRequest::Scan(new)) = (filter, &mut request) {
                    new.targets = Self::filtered_targets(filter, now, &mut *tx).await?;
                    if new.targets.is_empty() {
                        tx.commit().await?;
                        info!(%schedule_id, "no hosts match the schedule's filter, nothing to scan");
                        return Ok(None);
                    }
                }
                let job = Self::insert_job_request(&request, &mut *tx).await?;
                tx.commit().await?;
                Ok(Some(job))
            })
            .await
    }

    async fn filtered_targets(
        filter: &HostFilter,
        now: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> StoreResult<Vec<String>> {
        let hosts = Host::matching(filter, now, MAX_FILTERED_TARGETS, conn).await?;
        debug!(matched = hosts.len(), "resolved host filter");
        Ok(hosts.iter().map(|h| h.ip().to_string()).collect())
    }

    // =========================================================================
    // Scan profiles
    // =========================================================================

    pub async fn create_scan_profile(&self, new: &NewScanProfile) -> StoreResult<ScanProfile> {
        new.validate().map_err(invalid_input)?;
        ScanProfile::insert(new, &self.pool).await
    }

    pub async fn get_scan_profile(&self, id: &str) -> StoreResult<Option<ScanProfile>> {
        ScanProfile::find_by_id(id, &self.pool).await
    }

    pub async fn list_scan_profiles(&self) -> StoreResult<Vec<ScanProfile>> {
        ScanProfile::list(&self.pool).await
    }

    /// Deletes a custom profile; jobs that referenced it keep their
    /// resolved ports and lose the reference.
    pub async fn delete_scan_profile(&self, id: &str) -> StoreResult<bool> {
        ScanProfile::delete(id, &self.pool).await
    }

    /// The best profile for a host of `os_family`, if any profile exists.
    pub async fn select_scan_profile(&self, os_family: Option<&str>) -> StoreResult<Option<ScanProfile>> {
        let profiles = ScanProfile::list(&self.pool).await?;
        Ok(ScanProfile::select_best(&profiles, os_family).cloned())
    }
}
