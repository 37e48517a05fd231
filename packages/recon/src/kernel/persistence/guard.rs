//! Consistency guard.
//!
//! Locking existence checks on parent rows, run inside the same transaction
//! as the child insert that depends on them. The `FOR UPDATE` lock blocks a
//! concurrent `DELETE` of the parent until the writer commits or rolls back,
//! so a child row can never commit against a parent that is gone.
//!
//! Locks are always taken in id order to keep concurrent writers from
//! deadlocking on overlapping host sets.

use sqlx::PgConnection;
use std::collections::BTreeSet;
use tracing::debug;

use crate::common::{HostId, StoreError, StoreResult};
use crate::kernel::jobs::{JobRef, JobStatus, Transition};

/// Locks every distinct host in `ids`, failing with `ForeignKeyMissing`
/// naming all absent ids.
pub async fn lock_hosts(ids: &[HostId], conn: &mut PgConnection) -> StoreResult<()> {
    let wanted: BTreeSet<HostId> = ids.iter().copied().collect();
    if wanted.is_empty() {
        return Ok(());
    }
    let wanted_ids: Vec<HostId> = wanted.iter().copied().collect();

    let found: Vec<HostId> =
        sqlx::query_scalar("SELECT id FROM hosts WHERE id = ANY($1) ORDER BY id FOR UPDATE")
            .bind(&wanted_ids)
            .fetch_all(&mut *conn)
            .await?;

    let found: BTreeSet<HostId> = found.into_iter().collect();
    let missing: Vec<_> = wanted
        .difference(&found)
        .map(|id| id.into_uuid())
        .collect();
    if !missing.is_empty() {
        debug!(missing = missing.len(), "host rows missing under lock");
        return Err(StoreError::foreign_key_missing("hosts", missing));
    }
    Ok(())
}

/// Locks the job row and returns its current status.
pub async fn lock_job(job: JobRef, conn: &mut PgConnection) -> StoreResult<JobStatus> {
    let table = job.kind().table();
    let sql = format!("SELECT status FROM {} WHERE id = $1 FOR UPDATE", table);
    let status: Option<JobStatus> = sqlx::query_scalar(&sql)
        .bind(job.uuid())
        .fetch_optional(&mut *conn)
        .await?;
    status.ok_or_else(|| StoreError::foreign_key_missing(table, [job.uuid()]))
}

/// Locks the job row and checks that `transition` is legal from its current
/// status.
pub async fn lock_job_for(
    job: JobRef,
    transition: Transition,
    conn: &mut PgConnection,
) -> StoreResult<JobStatus> {
    let status = lock_job(job, conn).await?;
    if !transition.allowed_from(status) {
        return Err(illegal_transition(job, status, transition));
    }
    Ok(status)
}

pub(crate) fn illegal_transition(job: JobRef, status: JobStatus, transition: Transition) -> StoreError {
    StoreError::ConstraintViolation(format!(
        "{} is {}, cannot {}",
        job, status, transition
    ))
}
