//! Lifecycle and progress events handed to the notification sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{JobKind, JobRef};
use super::lifecycle::JobStatus;

/// Coarse progress checkpoints reported while a job runs.
pub mod progress {
    pub const CLAIMED: i32 = 0;
    pub const PROBE_STARTED: i32 = 10;
    pub const PROBE_FINISHED: i32 = 60;
    pub const RESULTS_PERSISTED: i32 = 90;
    pub const COMPLETED: i32 = 100;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job: JobRef, status: JobStatus, progress: i32) -> Self {
        Self {
            job_id: job.uuid(),
            kind: job.kind(),
            status,
            progress,
            message: None,
            at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn claimed(job: JobRef) -> Self {
        Self::new(job, JobStatus::Running, progress::CLAIMED).with_message("claimed")
    }

    pub fn progress(job: JobRef, progress: i32, message: impl Into<String>) -> Self {
        Self::new(job, JobStatus::Running, progress).with_message(message)
    }

    pub fn completed(job: JobRef) -> Self {
        Self::new(job, JobStatus::Completed, progress::COMPLETED)
    }

    pub fn failed(job: JobRef, progress: i32, reason: impl Into<String>) -> Self {
        Self::new(job, JobStatus::Failed, progress).with_message(reason)
    }

    pub fn cancelled(job: JobRef, progress: i32) -> Self {
        Self::new(job, JobStatus::Cancelled, progress)
    }

    pub fn job_ref(&self) -> JobRef {
        JobRef::new(self.kind, self.job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ScanJobId;

    #[test]
    fn completed_events_report_full_progress() {
        let job = JobRef::Scan(ScanJobId::new());
        let event = JobEvent::completed(job);
        assert_eq!(event.status, JobStatus::Completed);
        assert_eq!(event.progress, 100);
        assert_eq!(event.job_ref(), job);
    }

    #[test]
    fn serializes_without_empty_message() {
        let event = JobEvent::completed(JobRef::Scan(ScanJobId::new()));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["kind"], "scan");
        assert!(json.get("message").is_none());

        let failed = JobEvent::failed(event.job_ref(), 60, "probe exploded");
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["message"], "probe exploded");
    }
}
