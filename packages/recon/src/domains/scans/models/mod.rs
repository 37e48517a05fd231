pub mod port_scan;
pub mod scan_job;

pub use port_scan::*;
pub use scan_job::*;
