//! Job infrastructure: lifecycle rules, job types, progress events, and the
//! worker pool that executes claimed jobs.
//!
//! ```text
//! pending ──claim──► running ──complete──► completed
//!    │                  │
//!    │                  ├──fail──────────► failed
//!    └──cancel──────────┴──cancel────────► cancelled
//! ```

pub mod events;
mod job;
mod lifecycle;
pub mod worker;

pub use events::JobEvent;
pub use job::{Job, JobKind, JobRef, JobRequest};
pub use lifecycle::{JobStatus, Transition};
pub use worker::{PoolStats, ShutdownReport, WorkerPool, WorkerPoolConfig};
