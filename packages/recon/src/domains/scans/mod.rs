//! Scans: port-probe jobs and the results they produce.

pub mod models;
pub mod targets;

pub use models::{NewPortScan, NewScanJob, PortScan, PortScanResult, ScanJob};
pub use targets::{parse_ports, ScanTarget};
