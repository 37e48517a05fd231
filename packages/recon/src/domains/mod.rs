pub mod discovery;
pub mod hosts;
pub mod profiles;
pub mod scans;
pub mod schedules;
