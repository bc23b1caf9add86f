use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};

use chrono::{DateTime, Duration, Utc};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use pulse_core::ConfigError;

use crate::scheduler::clock::{Clock, SystemClock};
use crate::scheduler::metrics::SchedulerMetrics;
use crate::scheduler::task::JobHandler;
use crate::scheduler::types::{JobStatus, SchedulerConfig, StopReport, MIN_RETRY_BACKOFF};

use super::execution::ExecutionUnit;

/// Sentinel for "never ran" in the atomic timestamp slots.
const NEVER: i64 = i64::MIN;

/// A registered job. Only the job's own execution unit writes
/// `last_run`/`next_run`; everyone else only reads.
pub(crate) struct JobEntry {
    pub(crate) name: String,
    pub(crate) interval: Duration,
    pub(crate) handler: Arc<dyn JobHandler>,
    last_run_us: AtomicI64,
    next_run_us: AtomicI64,
}

impl JobEntry {
    fn new(name: String, interval: Duration, handler: Arc<dyn JobHandler>, now: DateTime<Utc>) -> Self {
        Self {
            name,
            interval,
            handler,
            last_run_us: AtomicI64::new(NEVER),
            next_run_us: AtomicI64::new(now.timestamp_micros()),
        }
    }

    pub(crate) fn last_run(&self) -> Option<DateTime<Utc>> {
        match self.last_run_us.load(Ordering::Acquire) {
            NEVER => None,
            us => DateTime::from_timestamp_micros(us),
        }
    }

    pub(crate) fn next_run(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.next_run_us.load(Ordering::Acquire))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub(crate) fn set_last_run(&self, at: DateTime<Utc>) {
        self.last_run_us.store(at.timestamp_micros(), Ordering::Release);
    }

    pub(crate) fn set_next_run(&self, at: DateTime<Utc>) {
        self.next_run_us.store(at.timestamp_micros(), Ordering::Release);
    }
}

/// A spawned execution unit.
struct Unit {
    name: String,
    handle: JoinHandle<()>,
    /// Set when `stop()` gives up on the unit; its in-flight cycle is then
    /// allowed to finish but not recorded.
    detached: Arc<AtomicBool>,
}

/// Periodic job scheduler.
///
/// Each registered job gets its own execution unit on the tokio runtime.
/// Units poll their job's `next_run` once per tick and run the handler when
/// due. A failing handler is logged and retried after the backoff; it never
/// affects other jobs or the scheduler itself.
pub struct Scheduler {
    pub(super) config: SchedulerConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) jobs: RwLock<Vec<Arc<JobEntry>>>,
    pub(super) running: Arc<AtomicBool>,
    pub(super) shutdown: Arc<Notify>,
    pub(super) metrics: Arc<RwLock<SchedulerMetrics>>,
    units: Mutex<Vec<Unit>>,
    runtime: Mutex<Option<Handle>>,
    /// Held across every running-flag transition and unit spawn, so a job
    /// never gets a unit from both `register` and `start`.
    lifecycle: Mutex<()>,
}

impl Scheduler {
    /// Create a scheduler driven by the system clock.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            jobs: RwLock::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            metrics: Arc::new(RwLock::new(SchedulerMetrics::default())),
            units: Mutex::new(Vec::new()),
            runtime: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    /// Register a periodic job. The first cycle is due immediately.
    ///
    /// Registering while the scheduler runs spawns the job's unit at once.
    pub fn register(
        &self,
        name: impl Into<String>,
        interval_seconds: i64,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        let interval = Duration::try_seconds(interval_seconds)
            .filter(|_| interval_seconds > 0)
            .ok_or_else(|| ConfigError::InvalidInterval {
                name: name.clone(),
                interval_seconds,
            })?;

        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = {
            let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
            if jobs.iter().any(|j| j.name == name) {
                return Err(ConfigError::DuplicateJob(name));
            }
            let entry = Arc::new(JobEntry::new(name, interval, handler, self.clock.now()));
            jobs.push(Arc::clone(&entry));
            entry
        };

        info!(job = %entry.name, interval_seconds, "Registered job");

        if self.is_running() {
            let handle = self.runtime.lock().unwrap_or_else(PoisonError::into_inner).clone();
            if let Some(handle) = handle {
                self.spawn_unit(&handle, entry);
            }
        }
        Ok(())
    }

    /// Start one execution unit per registered job.
    ///
    /// Must be called from within a tokio runtime. Returns `false` (and
    /// changes nothing) if the scheduler is already running.
    pub fn start(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return false;
        }
        let handle = match Handle::try_current() {
            Ok(h) => h,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                error!(error = %e, "Scheduler start requires a tokio runtime");
                return false;
            }
        };
        *self.runtime.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());

        let jobs: Vec<Arc<JobEntry>> = self.read_jobs().iter().cloned().collect();
        for job in &jobs {
            self.spawn_unit(&handle, Arc::clone(job));
        }
        info!(jobs = jobs.len(), tick_ms = self.config.tick.as_millis() as u64, "Scheduler started");
        true
    }

    /// Signal every unit to exit and wait up to the shutdown timeout for each.
    ///
    /// Units still busy after the timeout are reported as stragglers, not
    /// aborted: their in-flight cycle completes in the background.
    pub async fn stop(&self) -> StopReport {
        let units = {
            let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.running.swap(false, Ordering::SeqCst) {
                return StopReport::default();
            }
            *self.runtime.lock().unwrap_or_else(PoisonError::into_inner) = None;
            self.shutdown.notify_waiters();
            std::mem::take(&mut *self.units.lock().unwrap_or_else(PoisonError::into_inner))
        };
        let mut report = StopReport::default();
        for mut unit in units {
            match tokio::time::timeout(self.config.shutdown_timeout, &mut unit.handle).await {
                Ok(_) => report.stopped.push(unit.name),
                Err(_) => {
                    // Under the metrics lock, so a cycle that is recording
                    // its outcome either finishes first or sees the flag.
                    {
                        let _metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
                        unit.detached.store(true, Ordering::SeqCst);
                    }
                    warn!(
                        job = %unit.name,
                        timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                        "Job did not stop within timeout"
                    );
                    report.stragglers.push(unit.name);
                }
            }
        }
        info!(
            stopped = report.stopped.len(),
            stragglers = report.stragglers.len(),
            "Scheduler stopped"
        );
        report
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of every registered job, in registration order.
    pub fn status(&self) -> Vec<JobStatus> {
        let running = self.is_running();
        let metrics = self.metrics();
        self.read_jobs()
            .iter()
            .map(|job| JobStatus {
                name: job.name.clone(),
                interval_seconds: job.interval.num_seconds(),
                last_run: job.last_run(),
                next_run: job.next_run(),
                running,
                metrics: metrics.job(&job.name),
            })
            .collect()
    }

    pub fn job_count(&self) -> usize {
        self.read_jobs().len()
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Number of spawned units that have not exited yet.
    pub(super) fn live_units(&self) -> usize {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|u| !u.handle.is_finished())
            .count()
    }

    pub(super) fn read_jobs(&self) -> RwLockReadGuard<'_, Vec<Arc<JobEntry>>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_unit(&self, handle: &Handle, job: Arc<JobEntry>) {
        let detached = Arc::new(AtomicBool::new(false));
        let name = job.name.clone();
        let unit = ExecutionUnit {
            job,
            clock: Arc::clone(&self.clock),
            running: Arc::clone(&self.running),
            shutdown: Arc::clone(&self.shutdown),
            metrics: Arc::clone(&self.metrics),
            tick: self.config.tick,
            retry_backoff: self.config.retry_backoff.max(MIN_RETRY_BACKOFF),
            detached: Arc::clone(&detached),
        };
        let join = handle.spawn(unit.run());
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Unit { name, handle: join, detached });
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Units hold their own handles to the flag and exit on their next check.
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }
}
