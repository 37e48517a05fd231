//! Kernel module - orchestration infrastructure and dependencies.

pub mod jobs;
pub mod notifications;
pub mod orchestrator;
pub mod persistence;
pub mod retry;
pub mod scheduled_tasks;
pub mod server_kernel;
pub mod tcp_probe;
pub mod test_dependencies;
pub mod traits;

pub use notifications::{notify, BroadcastNotificationSink, TracingNotificationSink};
pub use orchestrator::Orchestrator;
pub use persistence::PersistenceGateway;
pub use retry::{RetryConfig, RetryPolicy};
pub use scheduled_tasks::start_scheduler;
pub use server_kernel::ServerKernel;
pub use tcp_probe::{TcpConnectProbe, TcpProbeConfig};
pub use test_dependencies::TestDependencies;
pub use traits::*;
