//! Periodic collection scheduler with failure isolation and health reporting.
//!
//! Each registered [`JobHandler`] runs in its own execution unit. A failed
//! cycle is retried after a fixed backoff; a job that stops succeeding shows
//! up in [`Scheduler::health_check`] rather than as an error.

pub mod clock;
pub mod collect;
pub mod metrics;
pub mod runner;
pub mod task;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collect::{CollectionJob, Collector};
pub use metrics::{JobMetrics, SchedulerMetrics};
pub use runner::Scheduler;
pub use task::{blocking_fn, handler_fn, CollectionError, JobHandler};
pub use types::{HealthReport, JobStatus, SchedulerConfig, StopReport, MIN_RETRY_BACKOFF};
