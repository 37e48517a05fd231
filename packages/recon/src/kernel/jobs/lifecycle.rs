//! Job lifecycle state machine.
//!
//! `pending → running → {completed | failed | cancelled}`, with `pending →
//! cancelled` as the only other edge. Terminal states are absorbing. The
//! persistence gateway turns every transition into a conditional update
//! whose `WHERE status IN (...)` clause is derived from [`Transition::sources`],
//! so a transition lost to a concurrent writer is observably a no-op.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

/// The named edges of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// pending → running. Grants exclusive execution rights.
    Claim,
    Complete,
    Fail,
    Cancel,
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Claim => JobStatus::Running,
            Transition::Complete => JobStatus::Completed,
            Transition::Fail => JobStatus::Failed,
            Transition::Cancel => JobStatus::Cancelled,
        }
    }

    /// Statuses this transition may start from.
    pub fn sources(&self) -> &'static [JobStatus] {
        match self {
            Transition::Claim => &[JobStatus::Pending],
            Transition::Complete | Transition::Fail => &[JobStatus::Running],
            Transition::Cancel => &[JobStatus::Pending, JobStatus::Running],
        }
    }

    pub fn allowed_from(&self, current: JobStatus) -> bool {
        self.sources().contains(&current)
    }

    /// SQL list literal for the source statuses, e.g. `'pending', 'running'`.
    ///
    /// Built only from the fixed enum names above, never from input.
    pub fn source_list_sql(&self) -> String {
        self.sources()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transition::Claim => "claim",
            Transition::Complete => "complete",
            Transition::Fail => "fail",
            Transition::Cancel => "cancel",
        };
        f.write_str(name)
    }
}
