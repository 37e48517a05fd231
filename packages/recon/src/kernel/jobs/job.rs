//! Job identity shared by scan and discovery jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::lifecycle::JobStatus;
use crate::common::{DiscoveryJobId, ScanJobId};
use crate::domains::discovery::models::{DiscoveryJob, NewDiscoveryJob};
use crate::domains::scans::models::{NewScanJob, ScanJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Scan,
    Discovery,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Scan => "scan",
            JobKind::Discovery => "discovery",
        }
    }

    /// Table holding rows of this kind.
    pub fn table(&self) -> &'static str {
        match self {
            JobKind::Scan => "scan_jobs",
            JobKind::Discovery => "discovery_jobs",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scan" => Ok(JobKind::Scan),
            "discovery" => Ok(JobKind::Discovery),
            other => Err(format!("unknown job kind '{}'", other)),
        }
    }
}

/// A typed reference to either kind of job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum JobRef {
    Scan(ScanJobId),
    Discovery(DiscoveryJobId),
}

impl JobRef {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRef::Scan(_) => JobKind::Scan,
            JobRef::Discovery(_) => JobKind::Discovery,
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            JobRef::Scan(id) => id.into_uuid(),
            JobRef::Discovery(id) => id.into_uuid(),
        }
    }

    pub fn new(kind: JobKind, id: Uuid) -> Self {
        match kind {
            JobKind::Scan => JobRef::Scan(ScanJobId::from_uuid(id)),
            JobKind::Discovery => JobRef::Discovery(DiscoveryJobId::from_uuid(id)),
        }
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} job {}", self.kind(), self.uuid())
    }
}

impl From<ScanJobId> for JobRef {
    fn from(id: ScanJobId) -> Self {
        JobRef::Scan(id)
    }
}

impl From<DiscoveryJobId> for JobRef {
    fn from(id: DiscoveryJobId) -> Self {
        JobRef::Discovery(id)
    }
}

/// A job row of either kind.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    Scan(ScanJob),
    Discovery(DiscoveryJob),
}

impl Job {
    pub fn job_ref(&self) -> JobRef {
        match self {
            Job::Scan(job) => JobRef::Scan(job.id),
            Job::Discovery(job) => JobRef::Discovery(job.id),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Job::Scan(job) => job.status,
            Job::Discovery(job) => job.status,
        }
    }

    pub fn progress(&self) -> i32 {
        match self {
            Job::Scan(job) => job.progress,
            Job::Discovery(job) => job.progress,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Job::Scan(job) => job.error_message.as_deref(),
            Job::Discovery(job) => job.error_message.as_deref(),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Job::Scan(job) => job.created_at,
            Job::Discovery(job) => job.created_at,
        }
    }

    pub fn as_scan(&self) -> Option<&ScanJob> {
        match self {
            Job::Scan(job) => Some(job),
            Job::Discovery(_) => None,
        }
    }

    pub fn as_discovery(&self) -> Option<&DiscoveryJob> {
        match self {
            Job::Discovery(job) => Some(job),
            Job::Scan(_) => None,
        }
    }
}

impl From<ScanJob> for Job {
    fn from(job: ScanJob) -> Self {
        Job::Scan(job)
    }
}

impl From<DiscoveryJob> for Job {
    fn from(job: DiscoveryJob) -> Self {
        Job::Discovery(job)
    }
}

/// A request to create a job of either kind.
#[derive(Debug, Clone)]
pub enum JobRequest {
    Scan(NewScanJob),
    Discovery(NewDiscoveryJob),
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Scan(_) => JobKind::Scan,
            JobRequest::Discovery(_) => JobKind::Discovery,
        }
    }
}
