//! Entity markers and the id aliases used across the crate.

pub use super::id::Id;

/// A network endpoint keyed by IP address.
pub struct Host;

/// A request to probe ports on a set of targets.
pub struct ScanJob;

/// A request to enumerate live hosts in a network range.
pub struct DiscoveryJob;

/// A single port result produced by a scan job.
pub struct PortScan;

/// A recurring job definition.
pub struct Schedule;

pub type HostId = Id<Host>;
pub type ScanJobId = Id<ScanJob>;
pub type DiscoveryJobId = Id<DiscoveryJob>;
pub type PortScanId = Id<PortScan>;
pub type ScheduleId = Id<Schedule>;
