use crate::scheduler::types::HealthReport;

use super::Scheduler;

impl Scheduler {
    /// Report jobs that have gone quiet.
    ///
    /// A job is stale once `now - last_run` exceeds `stale_factor` times its
    /// interval. While running, a job that has never completed a cycle is
    /// reported too. Healthy means no issues.
    pub fn health_check(&self) -> HealthReport {
        let now = self.clock.now();
        let running = self.is_running();
        let factor = i32::try_from(self.config.stale_factor).unwrap_or(i32::MAX);

        let mut issues = Vec::new();
        for job in self.read_jobs().iter() {
            match job.last_run() {
                Some(last) => {
                    let elapsed = now - last;
                    let limit = job.interval.checked_mul(factor).unwrap_or(chrono::Duration::MAX);
                    if elapsed > limit {
                        issues.push(format!(
                            "Job '{}' hasn't run in {}s",
                            job.name,
                            elapsed.num_seconds()
                        ));
                    }
                }
                None if running => issues.push(format!("Job '{}' hasn't run yet", job.name)),
                None => {}
            }
        }

        HealthReport {
            healthy: issues.is_empty(),
            running,
            active_jobs: if running { self.live_units() } else { 0 },
            issues,
            timestamp: now,
        }
    }
}
