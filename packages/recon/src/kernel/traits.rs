// Collaborator traits for dependency injection
//
// Infrastructure seams only: the probes that touch the network and the sink
// that relays job events outward. Orchestration logic lives elsewhere.
//
// Naming convention: Base* for trait names (e.g., BaseScanProbe)

use anyhow::Result;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domains::discovery::models::{DiscoveredHost, DiscoveryMethod};
use crate::domains::scans::models::PortScanResult;
use crate::kernel::jobs::JobEvent;

/// Why a probe stopped without a full result set. `partial` counts results
/// gathered before stopping; those are never persisted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("probe cancelled")]
    Cancelled { partial: usize },

    #[error("probe timed out")]
    Timeout { partial: usize },

    #[error("probe failed: {message}")]
    Failed { message: String, partial: usize },
}

impl ProbeError {
    pub fn failed(message: impl Into<String>) -> Self {
        ProbeError::Failed {
            message: message.into(),
            partial: 0,
        }
    }

    pub fn partial(&self) -> usize {
        match self {
            ProbeError::Cancelled { partial }
            | ProbeError::Timeout { partial }
            | ProbeError::Failed { partial, .. } => *partial,
        }
    }
}

/// Options forwarded to the scan probe from the job row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    pub ports: Vec<u16>,
    pub scan_type: String,
    pub profile_id: Option<String>,
}

// =============================================================================
// Probe traits
// =============================================================================

#[async_trait]
pub trait BaseScanProbe: Send + Sync {
    /// Probe `ports` on every target. Must return promptly with
    /// `ProbeError::Cancelled` once `cancel` fires.
    async fn execute(
        &self,
        cancel: CancellationToken,
        targets: &[String],
        options: &ScanOptions,
    ) -> Result<Vec<PortScanResult>, ProbeError>;
}

#[async_trait]
pub trait BaseDiscoveryProbe: Send + Sync {
    async fn discover(
        &self,
        cancel: CancellationToken,
        network: IpNetwork,
        method: DiscoveryMethod,
    ) -> Result<Vec<DiscoveredHost>, ProbeError>;
}

// =============================================================================
// Notification trait
// =============================================================================

/// Fire-and-forget delivery of job events. Errors are logged by the caller
/// and never affect the transition that produced the event.
pub trait BaseNotificationSink: Send + Sync {
    fn publish(&self, event: JobEvent) -> Result<()>;
}
