pub mod scan_profile;

pub use scan_profile::*;
