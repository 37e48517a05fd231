//! Schedules: cron-driven recurring scan and discovery jobs.

pub mod cron_expr;
pub mod models;
pub mod scheduler;

pub use cron_expr::CronExpression;
pub use models::{NewSchedule, Schedule, ScheduleConfig};
pub use scheduler::{Scheduler, SchedulerConfig};
