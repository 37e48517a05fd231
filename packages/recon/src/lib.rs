// Network reconnaissance orchestration core
//
// Schedules, claims, and executes scan and discovery jobs against Postgres,
// keeping every result write foreign-key safe under concurrent deletes.
// Network probing itself sits behind the traits in kernel/traits.rs.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use config::*;
