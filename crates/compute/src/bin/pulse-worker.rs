//! pulse-worker — runs the collection scheduler and the analytics views.
//!
//! Subcommands:
//! - `run` — tail JSONL record files on the configured collector intervals,
//!   logging health and the current pulse until Ctrl-C.
//! - `analyze` — load a JSONL file once and print series, anomalies and
//!   forecasts as JSON, with "now" pinned to the newest record.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

use pulse_compute::scheduler::{
    Clock, CollectionError, CollectionJob, Collector, ManualClock, SystemClock,
};
use pulse_compute::PulseService;
use pulse_core::config::load_dotenv;
use pulse_core::{Config, MemoryRecordStore, RawRecordStore, RawSignalRecord, SignalType};

// ── CLI ─────────────────────────────────────────────────────────────

/// City pulse worker — scheduled collection, anomaly detection, and forecasting.
#[derive(Parser, Debug)]
#[command(name = "pulse-worker", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler against JSONL record feeds.
    Run {
        /// JSONL feed of mood records (social collector).
        #[arg(long, env = "PULSE_MOOD_RECORDS")]
        mood_records: Option<PathBuf>,

        /// JSONL feed of environmental readings.
        #[arg(long, env = "PULSE_ENV_RECORDS")]
        env_records: Option<PathBuf>,

        /// Health log interval in seconds.
        #[arg(long, env = "PULSE_HEALTH_INTERVAL", default_value_t = 30)]
        health_interval: u64,
    },
    /// Print analytics for a JSONL record file as JSON.
    Analyze {
        /// JSONL file of raw signal records.
        #[arg(long)]
        records: PathBuf,

        /// Entity to report on; omit for the city-wide views.
        #[arg(long)]
        entity: Option<String>,

        /// Signal type for the series view.
        #[arg(long, default_value = "mood")]
        signal: SignalType,

        #[arg(long, default_value_t = 24)]
        hours_ahead: u32,

        /// Defaults to DEFAULT_WINDOW_HOURS.
        #[arg(long)]
        window_hours: Option<u32>,
    },
}

// ── JSONL collector ─────────────────────────────────────────────────

/// Parse complete JSONL lines, skipping (and counting) malformed ones.
fn parse_jsonl(text: &str) -> (Vec<RawSignalRecord>, usize) {
    let mut records = Vec::new();
    let mut invalid = 0;
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RawSignalRecord>(line) {
            Ok(r) => records.push(r),
            Err(e) => {
                invalid += 1;
                warn!(line = lineno + 1, error = %e, "skipping malformed record");
            }
        }
    }
    (records, invalid)
}

/// Tails an append-only JSONL file. The read offset only advances once a
/// cycle's batch is committed, so a failed cycle re-reads the same lines.
struct JsonlCollector {
    name: String,
    path: PathBuf,
    committed: Mutex<usize>,
    pending: Mutex<usize>,
}

impl JsonlCollector {
    fn new(name: &str, path: &Path) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            committed: Mutex::new(0),
            pending: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Collector for JsonlCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self) -> Result<Vec<RawSignalRecord>, CollectionError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| CollectionError::Failed(format!("{}: {}", self.path.display(), e)))?;

        let mut offset = *self.committed.lock().unwrap_or_else(PoisonError::into_inner);
        if bytes.len() < offset {
            warn!(path = %self.path.display(), "feed shrank, re-reading from start");
            offset = 0;
        }

        // Only consume complete lines; a partial trailing line waits for the next cycle.
        let tail = &bytes[offset..];
        let Some(last_newline) = tail.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        let chunk = &tail[..=last_newline];
        let end = offset + chunk.len();

        let (records, invalid) = parse_jsonl(&String::from_utf8_lossy(chunk));
        if records.is_empty() {
            // Nothing to commit; move past the malformed lines now.
            *self.committed.lock().unwrap_or_else(PoisonError::into_inner) = end;
        } else {
            *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = end;
        }
        if invalid > 0 {
            warn!(collector = %self.name, invalid, "malformed lines skipped");
        }
        Ok(records)
    }

    async fn on_committed(&self, _count: usize) {
        let end = *self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *self.committed.lock().unwrap_or_else(PoisonError::into_inner) = end;
    }
}

// ── Subcommands ─────────────────────────────────────────────────────

async fn run(
    config: Config,
    mood_records: Option<PathBuf>,
    env_records: Option<PathBuf>,
    health_interval: u64,
) -> anyhow::Result<()> {
    let store: Arc<dyn RawRecordStore> = Arc::new(MemoryRecordStore::new());
    let service = PulseService::from_config(&config, Arc::clone(&store), Arc::new(SystemClock))?;
    let scheduler = Arc::clone(service.scheduler());

    let feeds = [
        ("social_media", mood_records, config.collectors.mood_interval_secs),
        ("environmental", env_records, config.collectors.environment_interval_secs),
    ];
    for (name, path, interval) in feeds {
        let Some(path) = path else { continue };
        let collector = Arc::new(JsonlCollector::new(name, &path));
        let job = CollectionJob::new(collector, Arc::clone(&store));
        scheduler.register(name, i64::try_from(interval)?, job.into_handler())?;
        info!(job = name, path = %path.display(), "feed attached");
    }
    if scheduler.job_count() == 0 {
        warn!("no feeds given; scheduler will only report health");
    }

    scheduler.start();
    info!("pulse-worker started");

    let mut ticker = tokio::time::interval(Duration::from_secs(health_interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                let health = service.health();
                if health.healthy {
                    info!(active_jobs = health.active_jobs, "health ok");
                } else {
                    warn!(issues = ?health.issues, "health degraded");
                }
                match service.current_pulse() {
                    Ok(pulse) => info!(
                        city_mood_index = pulse.city_mood_index,
                        entities = pulse.total_entities,
                        "current pulse"
                    ),
                    Err(e) => warn!(error = %e, "pulse unavailable"),
                }
            }
        }
    }

    let report = scheduler.stop().await;
    if !report.is_clean() {
        warn!(stragglers = ?report.stragglers, "jobs still running at exit");
    }
    info!("pulse-worker exited cleanly");
    Ok(())
}

fn analyze(
    config: Config,
    path: &Path,
    entity: Option<String>,
    signal: SignalType,
    hours_ahead: u32,
    window_hours: Option<u32>,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)?;
    let (records, invalid) = parse_jsonl(&text);
    let now = records.iter().map(|r| r.timestamp).max().unwrap_or_else(Utc::now);

    let store = Arc::new(MemoryRecordStore::new());
    let loaded = store.append_batch(records)?;
    info!(loaded, invalid, now = %now, "records loaded");

    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(now));
    let service = PulseService::from_config(&config, store, clock)?;
    let window = window_hours.unwrap_or(service.default_window_hours());

    let output = match entity.as_deref() {
        Some(entity) => json!({
            "entity": entity,
            "series": service.get_series(entity, signal, window)?,
            "anomalies": service.get_anomalies(Some(entity), window)?,
            "forecast": service.forecast_signal(entity, signal, hours_ahead)?,
            "environment": service.environment_overview(Some(entity))?,
        }),
        None => json!({
            "pulse": service.current_pulse()?,
            "anomaly_summary": service.anomaly_summary(window)?,
            "city_forecast": service.city_forecast(hours_ahead)?,
            "environment": service.environment_overview(None)?,
        }),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_summary();

    match cli.command {
        Command::Run {
            mood_records,
            env_records,
            health_interval,
        } => run(config, mood_records, env_records, health_interval).await,
        Command::Analyze {
            records,
            entity,
            signal,
            hours_ahead,
            window_hours,
        } => analyze(config, &records, entity, signal, hours_ahead, window_hours),
    }
}
