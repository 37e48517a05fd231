//! Scan profiles: named port sets and scan types, optionally tied to an
//! OS family, that scan jobs can reference instead of spelling out ports.

pub mod models;

pub use models::{NewScanProfile, ScanProfile, DEFAULT_PROFILE_ID};
