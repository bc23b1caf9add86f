use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use pulse_compute::pipeline::anomaly::AnomalyReason;
use pulse_compute::pipeline::forecast::ForecastMethod;
use pulse_compute::scheduler::{Clock, CollectionError, CollectionJob, Collector, ManualClock};
use pulse_compute::{PulseService, Severity};
use pulse_core::{Config, EmotionScores, MemoryRecordStore, RawRecordStore, RawSignalRecord, SignalType};

/// Hands out one prepared batch per cycle.
struct QueueCollector {
    name: String,
    batches: Mutex<VecDeque<Vec<RawSignalRecord>>>,
}

impl QueueCollector {
    fn new(name: &str, batches: Vec<Vec<RawSignalRecord>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            batches: Mutex::new(batches.into()),
        })
    }
}

#[async_trait]
impl Collector for QueueCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self) -> Result<Vec<RawSignalRecord>, CollectionError> {
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 10, 18, 40, 0).unwrap()
}

fn hours_ago(h: i64) -> DateTime<Utc> {
    now() - chrono::Duration::hours(h)
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.scheduler.tick_ms = 10;
    config.scheduler.shutdown_timeout_secs = 1;
    config
}

fn mood_batch(entity: &str, values: &[f64]) -> Vec<RawSignalRecord> {
    let n = values.len() as i64;
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let ts = hours_ago(n - 1 - i as i64) - chrono::Duration::minutes(20);
            RawSignalRecord::scalar(entity, SignalType::Mood, v, ts, "feed")
        })
        .collect()
}

fn pm25_batch(entity: &str, values: &[f64]) -> Vec<RawSignalRecord> {
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let ts = hours_ago(1) + chrono::Duration::minutes(i as i64 * 5);
            RawSignalRecord::scalar(entity, SignalType::Pm25, v, ts, "sensor")
        })
        .collect()
}

#[tokio::test]
async fn collected_records_flow_into_anomalies_and_forecasts() {
    let store = Arc::new(MemoryRecordStore::new());
    let clock = Arc::new(ManualClock::new(now()));
    let service = PulseService::from_config(
        &fast_config(),
        Arc::clone(&store) as Arc<dyn RawRecordStore>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    )
    .unwrap();

    let social = QueueCollector::new(
        "social_media",
        vec![mood_batch("harbor", &[80.0, 82.0, 20.0, 81.0, 79.0, 80.0, 81.0])],
    );
    let environmental = QueueCollector::new("environmental", vec![pm25_batch("harbor", &[10.0, 20.0, 500.0])]);

    let scheduler = service.scheduler();
    scheduler
        .register("social_media", 10, CollectionJob::new(social, store.clone()).into_handler())
        .unwrap();
    scheduler
        .register("environmental", 300, CollectionJob::new(environmental, store.clone()).into_handler())
        .unwrap();

    assert!(scheduler.start());
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(store.len(), 10);
    let health = service.health();
    assert!(health.healthy, "issues: {:?}", health.issues);
    assert_eq!(health.active_jobs, 2);
    assert!(service.job_status().iter().all(|s| s.last_run == Some(now())));

    // Aggregation
    let series = service.get_series("harbor", SignalType::Mood, 24).unwrap();
    assert_eq!(series.len(), 7);
    assert_eq!(series[2].mean, 20.0);

    // Anomalies: the mood drop and the particulate spike.
    let report = service.get_anomalies(Some("harbor"), 24).unwrap();
    assert_eq!(report.anomaly_count, 2);
    let mood = report
        .anomalies
        .iter()
        .find(|a| a.reason == AnomalyReason::MoodSpike)
        .unwrap();
    assert_eq!(mood.bucket_start, series[2].start);
    assert_eq!(mood.severity, Severity::Medium);
    let pm = report
        .anomalies
        .iter()
        .find(|a| a.reason == AnomalyReason::ThresholdExceeded)
        .unwrap();
    assert_eq!(pm.signal, SignalType::Pm25);
    assert!((pm.flagged_fraction - 1.0 / 3.0).abs() < 1e-12);
    assert_eq!(pm.severity, Severity::Medium);

    // Forecast: exactly the horizon, hourly, inside the mood domain.
    let forecast = service.get_forecast("harbor", 12).unwrap();
    assert_eq!(forecast.len(), 12);
    assert_eq!(forecast[0].method, ForecastMethod::Regression);
    assert_eq!(forecast[0].timestamp, series[6].start + chrono::Duration::hours(1));
    assert!(forecast
        .windows(2)
        .all(|w| w[1].timestamp - w[0].timestamp == chrono::Duration::hours(1)));
    assert!(forecast.iter().all(|p| (0.0..=100.0).contains(&p.predicted)));

    let report = scheduler.stop().await;
    assert!(report.is_clean());
}

#[tokio::test]
async fn failed_cycle_commits_nothing_and_spares_other_jobs() {
    let store = Arc::new(MemoryRecordStore::new());
    let clock = Arc::new(ManualClock::new(now()));
    let service = PulseService::from_config(
        &fast_config(),
        Arc::clone(&store) as Arc<dyn RawRecordStore>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    )
    .unwrap();

    let mut poisoned = pm25_batch("docks", &[12.0, 14.0]);
    poisoned.push(RawSignalRecord::scalar("docks", SignalType::Pm25, f64::INFINITY, hours_ago(0), "sensor"));
    let bad = QueueCollector::new("environmental", vec![poisoned]);

    let happy = EmotionScores { joy: 0.8, neutral: 0.2, ..Default::default() };
    let good = QueueCollector::new(
        "social_media",
        vec![vec![RawSignalRecord::mood("docks", happy, now() - chrono::Duration::minutes(3), "feed")]],
    );

    let scheduler = service.scheduler();
    scheduler
        .register("environmental", 300, CollectionJob::new(bad, store.clone()).into_handler())
        .unwrap();
    scheduler
        .register("social_media", 10, CollectionJob::new(good, store.clone()).into_handler())
        .unwrap();
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Only the good job's single record made it in.
    assert_eq!(store.len(), 1);
    let status = service.job_status();
    assert_eq!(status[0].last_run, None);
    assert_eq!(status[0].metrics.failures, 1);
    assert_eq!(status[0].next_run, now() + chrono::Duration::seconds(60));
    assert_eq!(status[1].last_run, Some(now()));

    let health = service.health();
    assert!(!health.healthy);
    assert_eq!(health.issues, vec!["Job 'environmental' hasn't run yet".to_string()]);

    let pulse = service.current_pulse().unwrap();
    assert_eq!(pulse.total_entities, 1);
    assert_eq!(pulse.entities[0].post_count, 1);
    assert_eq!(pulse.entities[0].dominant_emotion, "joy");
    assert_eq!(pulse.city_mood_index, 100.0);

    scheduler.stop().await;
}
