//! Notification sinks for job events.
//!
//! The broadcast sink feeds in-process subscribers and the tracing sink
//! just logs. Delivery is best-effort: [`notify`] swallows sink failures
//! after logging them.

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::jobs::JobEvent;
use super::traits::BaseNotificationSink;

/// Hand `event` to `sink`, logging instead of propagating failures.
pub fn notify(sink: &dyn BaseNotificationSink, event: JobEvent) {
    let job_id = event.job_id;
    let status = event.status;
    if let Err(e) = sink.publish(event) {
        warn!(%job_id, %status, error = %e, "failed to publish job event");
    }
}

/// In-process fan-out over a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastNotificationSink {
    tx: broadcast::Sender<JobEvent>,
}

impl BroadcastNotificationSink {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastNotificationSink {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseNotificationSink for BroadcastNotificationSink {
    fn publish(&self, event: JobEvent) -> Result<()> {
        // No subscribers is not a failure.
        if self.tx.send(event).is_err() {
            debug!("job event dropped, no subscribers");
        }
        Ok(())
    }
}

/// Logs every event at info.
#[derive(Debug, Clone, Default)]
pub struct TracingNotificationSink;

impl BaseNotificationSink for TracingNotificationSink {
    fn publish(&self, event: JobEvent) -> Result<()> {
        info!(
            job_id = %event.job_id,
            kind = %event.kind,
            status = %event.status,
            progress = event.progress,
            message = event.message.as_deref().unwrap_or(""),
            "job event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ScanJobId;
    use crate::kernel::jobs::{JobRef, JobStatus};

    struct FailingSink;

    impl BaseNotificationSink for FailingSink {
        fn publish(&self, _event: JobEvent) -> Result<()> {
            anyhow::bail!("relay offline")
        }
    }

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastNotificationSink::new();
        let mut rx = sink.subscribe();
        let job = JobRef::Scan(ScanJobId::new());

        sink.publish(JobEvent::claimed(job)).unwrap();
        sink.publish(JobEvent::completed(job)).unwrap();

        assert_eq!(rx.recv().await.unwrap().status, JobStatus::Running);
        assert_eq!(rx.recv().await.unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn broadcast_sink_without_subscribers_is_ok() {
        let sink = BroadcastNotificationSink::new();
        assert_eq!(sink.subscriber_count(), 0);
        assert!(sink
            .publish(JobEvent::completed(JobRef::Scan(ScanJobId::new())))
            .is_ok());
    }

    #[test]
    fn tracing_sink_accepts_every_event() {
        let job = JobRef::Scan(ScanJobId::new());
        let sink = TracingNotificationSink;
        assert!(sink.publish(JobEvent::claimed(job)).is_ok());
        assert!(sink
            .publish(JobEvent::failed(job, 60, "execution timed out"))
            .is_ok());
    }

    #[test]
    fn notify_swallows_sink_errors() {
        notify(&FailingSink, JobEvent::completed(JobRef::Scan(ScanJobId::new())));
    }
}
