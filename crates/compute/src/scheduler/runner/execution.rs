use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::scheduler::clock::Clock;
use crate::scheduler::metrics::SchedulerMetrics;
use crate::scheduler::task::CollectionError;
use crate::scheduler::types::to_chrono;

use super::core::JobEntry;

/// The loop that owns one job's schedule.
pub(crate) struct ExecutionUnit {
    pub(crate) job: Arc<JobEntry>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) shutdown: Arc<Notify>,
    pub(crate) metrics: Arc<RwLock<SchedulerMetrics>>,
    pub(crate) tick: Duration,
    pub(crate) retry_backoff: Duration,
    pub(crate) detached: Arc<AtomicBool>,
}

impl ExecutionUnit {
    fn active(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.detached.load(Ordering::SeqCst)
    }

    /// Run until the scheduler stops. Cycles of one job never overlap:
    /// `next_run` only moves after the handler returns.
    pub(crate) async fn run(self) {
        debug!(job = %self.job.name, "Execution unit started");
        while self.active() {
            if self.clock.now() >= self.job.next_run() {
                self.run_cycle().await;
            }
            if !self.active() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {}
                _ = self.shutdown.notified() => {}
            }
        }
        debug!(job = %self.job.name, "Execution unit exited");
    }

    async fn run_cycle(&self) {
        let started = Instant::now();
        let handler = Arc::clone(&self.job.handler);
        // A panicking handler only takes down its own task.
        let outcome = match tokio::spawn(async move { handler.run().await }).await {
            Ok(result) => result,
            Err(e) => Err(CollectionError::Panicked(e.to_string())),
        };
        let elapsed = started.elapsed();

        // `stop()` flips `detached` under this lock; checking after taking it
        // keeps a late cycle from touching the job once `stop()` returned.
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        if self.detached.load(Ordering::SeqCst) {
            debug!(job = %self.job.name, "Discarding result of cycle finished after stop");
            return;
        }

        let now = self.clock.now();
        match outcome {
            Ok(()) => {
                self.job.set_last_run(now);
                self.job.set_next_run(add_or_max(now, self.job.interval));
                metrics.record_success(&self.job.name, elapsed);
                debug!(
                    job = %self.job.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    next_run = %self.job.next_run(),
                    "Job cycle completed"
                );
            }
            Err(e) => {
                let retry_at = add_or_max(now, to_chrono(self.retry_backoff));
                self.job.set_next_run(retry_at);
                metrics.record_failure(&self.job.name, elapsed, &e.to_string(), now);
                error!(
                    job = %self.job.name,
                    error = %e,
                    retry_at = %retry_at,
                    "Job cycle failed"
                );
            }
        }
    }
}

fn add_or_max(at: DateTime<Utc>, by: chrono::Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
