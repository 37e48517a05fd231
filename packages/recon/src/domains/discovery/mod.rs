//! Discovery: sweeping a network range for live hosts.

pub mod models;

pub use models::{DiscoveredHost, DiscoveryJob, DiscoveryMethod, NewDiscoveryJob};
