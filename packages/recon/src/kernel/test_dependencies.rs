// TestDependencies - mock implementations for testing
//
// Provides mock probes and a recording notification sink that can be
// injected into ServerKernel for tests.

use anyhow::Result;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use sqlx::PgPool;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::jobs::{JobEvent, JobRef, JobStatus};
use super::retry::{RetryConfig, RetryPolicy};
use super::{BaseDiscoveryProbe, BaseNotificationSink, BaseScanProbe, ProbeError, ScanOptions, ServerKernel};
use crate::domains::discovery::models::{DiscoveredHost, DiscoveryMethod};
use crate::domains::scans::models::PortScanResult;

// =============================================================================
// Probe behaviors
// =============================================================================

/// What a mock probe does when invoked.
#[derive(Clone)]
pub enum ProbeBehavior<T> {
    /// Return these results immediately.
    Return(Vec<T>),
    /// Fail with this message.
    Fail(String),
    /// Never return, even when cancelled.
    Hang,
    /// Block until cancelled, then report `ProbeError::Cancelled`.
    WaitForCancel,
    /// Block until the gate is notified, then return the results.
    /// Cancellation while waiting reports `ProbeError::Cancelled`.
    Gated(Arc<Notify>, Vec<T>),
}

async fn behave<T: Clone>(
    behavior: ProbeBehavior<T>,
    cancel: CancellationToken,
) -> std::result::Result<Vec<T>, ProbeError> {
    match behavior {
        ProbeBehavior::Return(results) => Ok(results),
        ProbeBehavior::Fail(message) => Err(ProbeError::failed(message)),
        ProbeBehavior::Hang => std::future::pending().await,
        ProbeBehavior::WaitForCancel => {
            cancel.cancelled().await;
            Err(ProbeError::Cancelled { partial: 0 })
        }
        ProbeBehavior::Gated(gate, results) => {
            tokio::select! {
                _ = cancel.cancelled() => Err(ProbeError::Cancelled { partial: results.len() }),
                _ = gate.notified() => Ok(results),
            }
        }
    }
}

// =============================================================================
// Mock Scan Probe
// =============================================================================

pub struct MockScanProbe {
    behavior: Mutex<ProbeBehavior<PortScanResult>>,
    calls: Mutex<Vec<(Vec<String>, ScanOptions)>>,
    started: Arc<Notify>,
}

impl MockScanProbe {
    pub fn new() -> Self {
        Self::with_behavior(ProbeBehavior::Return(Vec::new()))
    }

    pub fn with_behavior(behavior: ProbeBehavior<PortScanResult>) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: Mutex::new(Vec::new()),
            started: Arc::new(Notify::new()),
        }
    }

    pub fn returning(results: Vec<PortScanResult>) -> Self {
        Self::with_behavior(ProbeBehavior::Return(results))
    }

    pub fn set_behavior(&self, behavior: ProbeBehavior<PortScanResult>) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Notified once per invocation, before the behavior runs.
    pub fn started(&self) -> Arc<Notify> {
        self.started.clone()
    }

    /// Targets and options of every invocation
    pub fn calls(&self) -> Vec<(Vec<String>, ScanOptions)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Default for MockScanProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseScanProbe for MockScanProbe {
    async fn execute(
        &self,
        cancel: CancellationToken,
        targets: &[String],
        options: &ScanOptions,
    ) -> std::result::Result<Vec<PortScanResult>, ProbeError> {
        self.calls
            .lock()
            .unwrap()
            .push((targets.to_vec(), options.clone()));
        let behavior = self.behavior.lock().unwrap().clone();
        self.started.notify_one();
        behave(behavior, cancel).await
    }
}

// =============================================================================
// Mock Discovery Probe
// =============================================================================

pub struct MockDiscoveryProbe {
    behavior: Mutex<ProbeBehavior<DiscoveredHost>>,
    calls: Mutex<Vec<(IpNetwork, DiscoveryMethod)>>,
    started: Arc<Notify>,
}

impl MockDiscoveryProbe {
    pub fn new() -> Self {
        Self::with_behavior(ProbeBehavior::Return(Vec::new()))
    }

    pub fn with_behavior(behavior: ProbeBehavior<DiscoveredHost>) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: Mutex::new(Vec::new()),
            started: Arc::new(Notify::new()),
        }
    }

    pub fn returning(hosts: Vec<DiscoveredHost>) -> Self {
        Self::with_behavior(ProbeBehavior::Return(hosts))
    }

    pub fn set_behavior(&self, behavior: ProbeBehavior<DiscoveredHost>) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn started(&self) -> Arc<Notify> {
        self.started.clone()
    }

    pub fn calls(&self) -> Vec<(IpNetwork, DiscoveryMethod)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for MockDiscoveryProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseDiscoveryProbe for MockDiscoveryProbe {
    async fn discover(
        &self,
        cancel: CancellationToken,
        network: IpNetwork,
        method: DiscoveryMethod,
    ) -> std::result::Result<Vec<DiscoveredHost>, ProbeError> {
        self.calls.lock().unwrap().push((network, method));
        let behavior = self.behavior.lock().unwrap().clone();
        self.started.notify_one();
        behave(behavior, cancel).await
    }
}

// =============================================================================
// Recording notification sink
// =============================================================================

#[derive(Default)]
pub struct TestNotificationSink {
    events: RwLock<Vec<JobEvent>>,
}

impl TestNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn events_for(&self, job: JobRef) -> Vec<JobEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.job_ref() == job)
            .collect()
    }

    pub fn statuses_for(&self, job: JobRef) -> Vec<JobStatus> {
        self.events_for(job).iter().map(|e| e.status).collect()
    }

    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl BaseNotificationSink for TestNotificationSink {
    fn publish(&self, event: JobEvent) -> Result<()> {
        self.events
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        Ok(())
    }
}

// =============================================================================
// TestDependencies - Builder for test dependencies
// =============================================================================

#[derive(Clone)]
pub struct TestDependencies {
    pub scan_probe: Arc<MockScanProbe>,
    pub discovery_probe: Arc<MockDiscoveryProbe>,
    pub notifications: Arc<TestNotificationSink>,
    pub retry: RetryConfig,
}

impl TestDependencies {
    pub fn new() -> Self {
        Self {
            scan_probe: Arc::new(MockScanProbe::new()),
            discovery_probe: Arc::new(MockDiscoveryProbe::new()),
            notifications: Arc::new(TestNotificationSink::new()),
            retry: RetryConfig::default(),
        }
    }

    /// Set a mock scan probe
    pub fn mock_scan_probe(mut self, probe: MockScanProbe) -> Self {
        self.scan_probe = Arc::new(probe);
        self
    }

    /// Set a mock discovery probe
    pub fn mock_discovery_probe(mut self, probe: MockDiscoveryProbe) -> Self {
        self.discovery_probe = Arc::new(probe);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Convert into a ServerKernel for testing
    pub fn into_kernel(self, db_pool: PgPool) -> Arc<ServerKernel> {
        Arc::new(ServerKernel::new(
            db_pool,
            RetryPolicy::new(self.retry),
            self.scan_probe,
            self.discovery_probe,
            self.notifications,
        ))
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}
