//! Hosts: discovered network endpoints keyed by IP address.

pub mod models;

pub use models::{Host, HostFilter, HostSighting};
