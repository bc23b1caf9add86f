use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-job cycle counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobMetrics {
    /// Successful cycles.
    pub runs: u64,
    /// Failed cycles (errors and panics).
    pub failures: u64,
    /// Failures since the last success.
    pub consecutive_failures: u64,
    pub last_error: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Mean duration over all completed cycles.
    pub avg_duration: Duration,
}

impl JobMetrics {
    fn cycles(&self) -> u64 {
        self.runs + self.failures
    }

    // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
    fn fold_duration(&mut self, duration: Duration) {
        let count = self.cycles();
        self.avg_duration = if count <= 1 {
            duration
        } else {
            let prev_nanos = self.avg_duration.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }
}

/// Scheduler operational metrics, keyed by job name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    pub jobs: HashMap<String, JobMetrics>,
}

impl SchedulerMetrics {
    /// Record a successful cycle.
    pub fn record_success(&mut self, job: &str, duration: Duration) {
        let m = self.jobs.entry(job.to_string()).or_default();
        m.runs += 1;
        m.consecutive_failures = 0;
        m.fold_duration(duration);
    }

    /// Record a failed cycle.
    pub fn record_failure(&mut self, job: &str, duration: Duration, error: &str, at: DateTime<Utc>) {
        let m = self.jobs.entry(job.to_string()).or_default();
        m.failures += 1;
        m.consecutive_failures += 1;
        m.last_error = Some(error.to_string());
        m.last_failure_at = Some(at);
        m.fold_duration(duration);
    }

    pub fn job(&self, job: &str) -> JobMetrics {
        self.jobs.get(job).cloned().unwrap_or_default()
    }
}
