pub mod host;
pub mod host_filter;

pub use host::*;
pub use host_filter::*;
