use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use pulse_core::config::{SchedulerSettings, MIN_RETRY_BACKOFF_SECS};

use super::metrics::JobMetrics;

/// Shortest cooldown a failed job ever gets.
pub const MIN_RETRY_BACKOFF: Duration = Duration::from_secs(MIN_RETRY_BACKOFF_SECS);

/// Scheduler timing policy.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between due checks in each execution unit.
    pub tick: Duration,
    /// Cooldown before a failed job is retried. Values under
    /// `MIN_RETRY_BACKOFF` are raised to it when units are spawned.
    pub retry_backoff: Duration,
    /// How long `stop()` waits for each unit before reporting it.
    pub shutdown_timeout: Duration,
    /// A job is stale once it has not succeeded for `stale_factor * interval`.
    pub stale_factor: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_settings(&SchedulerSettings::default())
    }
}

impl SchedulerConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self {
            tick: Duration::from_millis(settings.tick_ms.max(1)),
            retry_backoff: Duration::from_secs(settings.retry_backoff_secs).max(MIN_RETRY_BACKOFF),
            shutdown_timeout: Duration::from_secs(settings.shutdown_timeout_secs),
            stale_factor: u32::try_from(settings.stale_factor.max(1)).unwrap_or(u32::MAX),
        }
    }
}

/// Snapshot of one registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub interval_seconds: i64,
    /// Time of the last successful cycle.
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    /// Whether the scheduler is running (jobs have no per-job running state).
    pub running: bool,
    pub metrics: JobMetrics,
}

/// Advisory health summary. Issues are human-readable strings.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub running: bool,
    pub active_jobs: usize,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of `Scheduler::stop()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StopReport {
    /// Units that exited within the shutdown timeout.
    pub stopped: Vec<String>,
    /// Units still busy after the timeout; left to finish on their own.
    pub stragglers: Vec<String>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.stragglers.is_empty()
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX / 1_000))
}
