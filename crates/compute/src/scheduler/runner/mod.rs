//! Periodic job runner -- one execution unit (tokio task) per job.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, registration, start/stop, and status
//! - `execution`: the per-job unit loop and cycle bookkeeping
//! - `health`: staleness checks over the job table

mod core;
mod execution;
mod health;

pub use self::core::Scheduler;
