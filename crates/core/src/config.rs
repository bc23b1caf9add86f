use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_f64(profile: &str, key: &str, default: f64) -> f64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .filter(|v: &f64| v.is_finite())
        .unwrap_or(default)
}

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub scheduler: SchedulerSettings,
    pub collectors: CollectorSettings,
    pub analytics: AnalyticsSettings,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `PULSE_PROFILE`. When set (e.g. `PROD`), every key
    /// is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("PULSE_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            scheduler: SchedulerSettings::from_env_profiled(p),
            collectors: CollectorSettings::from_env_profiled(p),
            analytics: AnalyticsSettings::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  scheduler:   tick={}ms, retry_backoff={}s, shutdown_timeout={}s, stale_factor={}",
            self.scheduler.tick_ms,
            self.scheduler.retry_backoff_secs,
            self.scheduler.shutdown_timeout_secs,
            self.scheduler.stale_factor
        );
        tracing::info!(
            "  collectors:  mood={}s, environment={}s",
            self.collectors.mood_interval_secs,
            self.collectors.environment_interval_secs
        );
        tracing::info!(
            "  analytics:   z={}, window={}h, lookback={}h, thresholds={}",
            self.analytics.z_threshold,
            self.analytics.default_window_hours,
            self.analytics.forecast_lookback_hours,
            self.analytics
                .thresholds_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(built-in)".to_string())
        );
    }
}

// ── Scheduler ─────────────────────────────────────────────────

/// Floor for the post-failure cooldown; lower configured values are raised to it.
pub const MIN_RETRY_BACKOFF_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Due-check tick per execution unit.
    pub tick_ms: u64,
    /// Fixed cooldown after a failed cycle, never below `MIN_RETRY_BACKOFF_SECS`.
    pub retry_backoff_secs: u64,
    /// Per-unit wait during `stop()`.
    pub shutdown_timeout_secs: u64,
    /// A job is stale once `now - last_run > stale_factor * interval`.
    pub stale_factor: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            retry_backoff_secs: 60,
            shutdown_timeout_secs: 5,
            stale_factor: 2,
        }
    }
}

impl SchedulerSettings {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            tick_ms: profiled_env_u64(p, "SCHEDULER_TICK_MS", d.tick_ms).max(1),
            retry_backoff_secs: profiled_env_u64(p, "SCHEDULER_RETRY_BACKOFF_SECS", d.retry_backoff_secs)
                .max(MIN_RETRY_BACKOFF_SECS),
            shutdown_timeout_secs: profiled_env_u64(p, "SCHEDULER_SHUTDOWN_TIMEOUT_SECS", d.shutdown_timeout_secs),
            stale_factor: profiled_env_u64(p, "SCHEDULER_STALE_FACTOR", d.stale_factor).max(1),
        }
    }
}

// ── Collectors ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorSettings {
    pub mood_interval_secs: u64,
    pub environment_interval_secs: u64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            mood_interval_secs: 10,
            environment_interval_secs: 300,
        }
    }
}

impl CollectorSettings {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            mood_interval_secs: profiled_env_u64(p, "MOOD_COLLECTOR_INTERVAL_SECS", d.mood_interval_secs),
            environment_interval_secs: profiled_env_u64(p, "ENV_COLLECTOR_INTERVAL_SECS", d.environment_interval_secs),
        }
    }
}

// ── Analytics ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsSettings {
    /// |z| above this flags a mood bucket.
    pub z_threshold: f64,
    /// Flagged fraction above this makes a mood anomaly `medium` (else `low`).
    pub mood_medium_fraction: f64,
    /// Flagged fraction above this makes a range anomaly `high` (else `medium`).
    pub range_high_fraction: f64,
    /// Minimum buckets (statistical) or samples (range) before evaluating.
    pub min_samples: usize,
    pub default_window_hours: u32,
    pub forecast_lookback_hours: u32,
    /// Optional YAML range table overriding the built-in one.
    pub thresholds_file: Option<PathBuf>,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            z_threshold: 2.0,
            mood_medium_fraction: 0.5,
            range_high_fraction: 0.7,
            min_samples: 3,
            default_window_hours: 24,
            forecast_lookback_hours: 168,
            thresholds_file: None,
        }
    }
}

impl AnalyticsSettings {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            z_threshold: profiled_env_f64(p, "ANOMALY_Z_THRESHOLD", d.z_threshold),
            mood_medium_fraction: profiled_env_f64(p, "ANOMALY_MOOD_MEDIUM_FRACTION", d.mood_medium_fraction),
            range_high_fraction: profiled_env_f64(p, "ANOMALY_RANGE_HIGH_FRACTION", d.range_high_fraction),
            min_samples: profiled_env_usize(p, "ANOMALY_MIN_SAMPLES", d.min_samples),
            default_window_hours: profiled_env_u64(p, "DEFAULT_WINDOW_HOURS", d.default_window_hours as u64) as u32,
            forecast_lookback_hours: profiled_env_u64(p, "FORECAST_LOOKBACK_HOURS", d.forecast_lookback_hours as u64) as u32,
            thresholds_file: profiled_env_opt(p, "THRESHOLDS_FILE").map(PathBuf::from),
        }
    }
}
