//! Read-model service over the raw-record store.
//!
//! [`PulseService`] is what the routing layer talks to. Every view is
//! recomputed from raw records on each call: fetch, bucket, then detect or
//! forecast. Nothing here caches or mutates shared state, so calls for
//! different entities or windows can run concurrently.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use pulse_core::config::AnalyticsSettings;
use pulse_core::{
    Config, ConfigError, EntityId, RawRecordStore, RawSignalRecord, RecordQuery, SignalFamily,
    SignalType, StoreError,
};

use crate::pipeline::aggregate::{bucket, split_series, truncate_to_hour, TimeBucket};
use crate::pipeline::anomaly::{AnomalyDetector, AnomalyFlag, AnomalyReason, Severity};
use crate::pipeline::forecast::{ForecastPoint, Forecaster};
use crate::scheduler::{Clock, HealthReport, JobStatus, Scheduler, SchedulerConfig};

/// Mood reported for an entity with no posts in the last hour.
pub const NEUTRAL_MOOD: f64 = 50.0;
/// Emotion reported for an entity with no posts in the last hour.
pub const NEUTRAL_EMOTION: &str = "neutral";
/// Number of entities listed in an anomaly summary.
pub const TOP_ENTITIES: usize = 5;

/// Anomalies over a window, with totals.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyReport {
    pub entity: Option<EntityId>,
    pub anomalies: Vec<AnomalyFlag>,
    /// Raw records that fell inside the window.
    pub total_data_points: usize,
    pub anomaly_count: usize,
    pub statistical_count: usize,
    pub range_count: usize,
    pub period_hours: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityAnomalyCount {
    pub entity_id: EntityId,
    pub count: usize,
}

/// Aggregate view of every anomaly in a window.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalySummary {
    pub total_anomalies: usize,
    pub statistical_count: usize,
    pub range_count: usize,
    pub severity_distribution: BTreeMap<Severity, usize>,
    /// Entities with the most anomalies, most first; ties by entity id.
    pub top_entities: Vec<EntityAnomalyCount>,
    pub period_hours: u32,
    pub timestamp: DateTime<Utc>,
}

/// Last-hour mood for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityPulse {
    pub entity_id: EntityId,
    pub mood_index: f64,
    pub post_count: usize,
    pub dominant_emotion: String,
}

/// Last-hour mood across all entities.
#[derive(Debug, Clone, Serialize)]
pub struct PulseSnapshot {
    pub city_mood_index: f64,
    pub total_entities: usize,
    pub entities: Vec<EntityPulse>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalSummary {
    pub signal: SignalType,
    pub average_value: f64,
    pub count: usize,
    pub unit: &'static str,
}

/// Last-hour physical readings, per signal type.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentOverview {
    pub entity: Option<EntityId>,
    pub signals: Vec<SignalSummary>,
    pub timestamp: DateTime<Utc>,
}

/// One horizon step of the city-wide forecast.
#[derive(Debug, Clone, Serialize)]
pub struct CityForecastStep {
    pub step: u32,
    pub timestamp: DateTime<Utc>,
    pub city_average: f64,
    pub entity_predictions: BTreeMap<EntityId, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CityForecast {
    pub hours_ahead: u32,
    pub entities: usize,
    pub steps: Vec<CityForecastStep>,
    pub timestamp: DateTime<Utc>,
}

/// Views over the pulse data, plus access to the collection scheduler.
pub struct PulseService {
    store: Arc<dyn RawRecordStore>,
    scheduler: Arc<Scheduler>,
    detector: AnomalyDetector,
    forecaster: Forecaster,
    clock: Arc<dyn Clock>,
    default_window_hours: u32,
    forecast_lookback_hours: u32,
}

impl PulseService {
    /// Compose a service from explicit parts. "Now" comes from the
    /// scheduler's clock.
    pub fn new(
        store: Arc<dyn RawRecordStore>,
        scheduler: Arc<Scheduler>,
        detector: AnomalyDetector,
        settings: &AnalyticsSettings,
    ) -> Self {
        let clock = scheduler.clock();
        Self {
            store,
            scheduler,
            detector,
            forecaster: Forecaster::new(),
            clock,
            default_window_hours: settings.default_window_hours.max(1),
            forecast_lookback_hours: settings.forecast_lookback_hours.max(1),
        }
    }

    /// Build the detector and scheduler from resolved configuration.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn RawRecordStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let detector = AnomalyDetector::from_settings(&config.analytics)?;
        let scheduler = Arc::new(Scheduler::with_clock(
            SchedulerConfig::from_settings(&config.scheduler),
            clock,
        ));
        info!(profile = config.profile_label(), "Pulse service ready");
        Ok(Self::new(store, scheduler, detector, &config.analytics))
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn RawRecordStore> {
        &self.store
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    pub fn default_window_hours(&self) -> u32 {
        self.default_window_hours
    }

    /// `[now - hours, end of the current hour)`, saturating at chrono's range.
    fn window(&self, hours: u32) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = self.clock.now();
        let start = Duration::try_hours(i64::from(hours))
            .and_then(|span| now.checked_sub_signed(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end = truncate_to_hour(now)
            .checked_add_signed(Duration::hours(1))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (start, end)
    }

    fn fetch(&self, query: &RecordQuery) -> Result<Vec<RawSignalRecord>, StoreError> {
        let records = self.store.fetch(query)?;
        debug!(
            entity = query.entity.as_deref().unwrap_or("*"),
            records = records.len(),
            "fetched records"
        );
        Ok(records)
    }

    /// Hourly buckets for one entity + signal over the last `window_hours`.
    pub fn get_series(
        &self,
        entity: &str,
        signal: SignalType,
        window_hours: u32,
    ) -> Result<Vec<TimeBucket>, StoreError> {
        let (start, end) = self.window(window_hours);
        let records = self.fetch(&RecordQuery::since(start).entity(entity).signal(signal))?;
        Ok(bucket(&records, start, end))
    }

    /// Anomalies for one entity (or all entities) over the last `window_hours`.
    pub fn get_anomalies(&self, entity: Option<&str>, window_hours: u32) -> Result<AnomalyReport, StoreError> {
        let (start, end) = self.window(window_hours);
        let mut query = RecordQuery::since(start);
        if let Some(entity) = entity {
            query = query.entity(entity);
        }
        let buckets = bucket(&self.fetch(&query)?, start, end);
        let total_data_points = buckets.iter().map(|b| b.sample_count).sum();

        let anomalies = self.detector.detect(buckets);
        let statistical_count = anomalies
            .iter()
            .filter(|a| a.reason == AnomalyReason::MoodSpike)
            .count();

        Ok(AnomalyReport {
            entity: entity.map(str::to_string),
            anomaly_count: anomalies.len(),
            statistical_count,
            range_count: anomalies.len() - statistical_count,
            anomalies,
            total_data_points,
            period_hours: window_hours,
            timestamp: self.clock.now(),
        })
    }

    /// Severity distribution and the entities with the most anomalies.
    pub fn anomaly_summary(&self, window_hours: u32) -> Result<AnomalySummary, StoreError> {
        let report = self.get_anomalies(None, window_hours)?;

        let mut severity_distribution: BTreeMap<Severity, usize> =
            [Severity::Low, Severity::Medium, Severity::High]
                .into_iter()
                .map(|s| (s, 0))
                .collect();
        let mut per_entity: BTreeMap<&str, usize> = BTreeMap::new();
        for a in &report.anomalies {
            *severity_distribution.entry(a.severity).or_default() += 1;
            *per_entity.entry(a.entity_id.as_str()).or_default() += 1;
        }

        let mut top_entities: Vec<EntityAnomalyCount> = per_entity
            .into_iter()
            .map(|(entity_id, count)| EntityAnomalyCount {
                entity_id: entity_id.to_string(),
                count,
            })
            .collect();
        // Stable sort keeps entity-id order among equal counts.
        top_entities.sort_by(|a, b| b.count.cmp(&a.count));
        top_entities.truncate(TOP_ENTITIES);

        Ok(AnomalySummary {
            total_anomalies: report.anomaly_count,
            statistical_count: report.statistical_count,
            range_count: report.range_count,
            severity_distribution,
            top_entities,
            period_hours: window_hours,
            timestamp: report.timestamp,
        })
    }

    /// Mood forecast for one entity from the configured lookback.
    pub fn get_forecast(&self, entity: &str, hours_ahead: u32) -> Result<Vec<ForecastPoint>, StoreError> {
        self.forecast_signal(entity, SignalType::Mood, hours_ahead)
    }

    pub fn forecast_signal(
        &self,
        entity: &str,
        signal: SignalType,
        hours_ahead: u32,
    ) -> Result<Vec<ForecastPoint>, StoreError> {
        let series = self.get_series(entity, signal, self.forecast_lookback_hours)?;
        Ok(self.forecaster.forecast(&series, hours_ahead))
    }

    /// Forecast every entity's mood independently and average per step.
    /// Entities without data are skipped.
    pub fn city_forecast(&self, hours_ahead: u32) -> Result<CityForecast, StoreError> {
        let (start, end) = self.window(self.forecast_lookback_hours);
        let records = self.fetch(&RecordQuery::since(start).signal(SignalType::Mood))?;
        let series = split_series(bucket(&records, start, end));

        let forecasts: Vec<(EntityId, Vec<ForecastPoint>)> = series
            .into_par_iter()
            .map(|((entity, _), s)| {
                let points = self.forecaster.forecast(&s, hours_ahead);
                (entity, points)
            })
            .filter(|(_, points)| !points.is_empty())
            .collect();

        let mut steps: BTreeMap<u32, CityForecastStep> = BTreeMap::new();
        for (entity, points) in &forecasts {
            for (step, point) in (1..=hours_ahead).zip(points) {
                let entry = steps.entry(step).or_insert_with(|| CityForecastStep {
                    step,
                    timestamp: point.timestamp,
                    city_average: 0.0,
                    entity_predictions: BTreeMap::new(),
                });
                entry.timestamp = entry.timestamp.min(point.timestamp);
                entry.entity_predictions.insert(entity.clone(), point.predicted);
            }
        }
        for step in steps.values_mut() {
            let n = step.entity_predictions.len() as f64;
            step.city_average = step.entity_predictions.values().sum::<f64>() / n;
        }

        Ok(CityForecast {
            hours_ahead,
            entities: forecasts.len(),
            steps: steps.into_values().collect(),
            timestamp: self.clock.now(),
        })
    }

    /// Last-hour mood per known entity and the city-wide mean.
    pub fn current_pulse(&self) -> Result<PulseSnapshot, StoreError> {
        let now = self.clock.now();
        let since = now - Duration::hours(1);
        let entities = self.store.entities()?;
        let records = self.fetch(&RecordQuery::since(since).signal(SignalType::Mood))?;

        let mut by_entity: BTreeMap<&str, Vec<&RawSignalRecord>> = BTreeMap::new();
        for r in records.iter().filter(|r| r.timestamp <= now) {
            by_entity.entry(r.entity_id.as_str()).or_default().push(r);
        }

        let pulses: Vec<EntityPulse> = entities
            .iter()
            .map(|entity| match by_entity.get(entity.as_str()) {
                Some(recent) => entity_pulse(entity, recent),
                None => EntityPulse {
                    entity_id: entity.clone(),
                    mood_index: NEUTRAL_MOOD,
                    post_count: 0,
                    dominant_emotion: NEUTRAL_EMOTION.to_string(),
                },
            })
            .collect();

        let city_mood_index = if pulses.is_empty() {
            NEUTRAL_MOOD
        } else {
            pulses.iter().map(|p| p.mood_index).sum::<f64>() / pulses.len() as f64
        };

        Ok(PulseSnapshot {
            city_mood_index,
            total_entities: pulses.len(),
            entities: pulses,
            timestamp: now,
        })
    }

    /// Last-hour mean and count per physical signal type.
    pub fn environment_overview(&self, entity: Option<&str>) -> Result<EnvironmentOverview, StoreError> {
        let now = self.clock.now();
        let mut query = RecordQuery::since(now - Duration::hours(1));
        if let Some(entity) = entity {
            query = query.entity(entity);
        }

        let mut sums: BTreeMap<SignalType, (f64, usize)> = BTreeMap::new();
        for r in self.fetch(&query)?.iter().filter(|r| r.timestamp <= now) {
            if r.signal.family() != SignalFamily::Physical {
                continue;
            }
            let slot = sums.entry(r.signal).or_insert((0.0, 0));
            slot.0 += r.score();
            slot.1 += 1;
        }

        Ok(EnvironmentOverview {
            entity: entity.map(str::to_string),
            signals: sums
                .into_iter()
                .map(|(signal, (sum, count))| SignalSummary {
                    signal,
                    average_value: sum / count as f64,
                    count,
                    unit: signal.unit(),
                })
                .collect(),
            timestamp: now,
        })
    }

    pub fn job_status(&self) -> Vec<JobStatus> {
        self.scheduler.status()
    }

    pub fn health(&self) -> HealthReport {
        self.scheduler.health_check()
    }
}

fn entity_pulse(entity: &str, recent: &[&RawSignalRecord]) -> EntityPulse {
    let mood_index = recent.iter().map(|r| r.score()).sum::<f64>() / recent.len() as f64;

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for r in recent {
        if let Some(d) = r.value.dominant() {
            *counts.entry(d).or_default() += 1;
        }
    }
    // Highest count; BTreeMap order makes ties go to the smallest name.
    let mut best: Option<(&str, usize)> = None;
    for (name, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((name, count));
        }
    }

    EntityPulse {
        entity_id: entity.to_string(),
        mood_index,
        post_count: recent.len(),
        dominant_emotion: best.map_or(NEUTRAL_EMOTION, |(name, _)| name).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::forecast::ForecastMethod;
    use crate::scheduler::ManualClock;
    use chrono::TimeZone;
    use pulse_core::{EmotionScores, MemoryRecordStore};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 2, 12, 30, 0).unwrap()
    }

    fn service(store: Arc<MemoryRecordStore>) -> PulseService {
        let clock = Arc::new(ManualClock::new(now()));
        PulseService::from_config(&Config::default(), store, clock).unwrap()
    }

    fn hours_ago(h: i64) -> DateTime<Utc> {
        now() - Duration::hours(h)
    }

    fn mood_series(store: &MemoryRecordStore, entity: &str, values: &[f64]) {
        // Oldest first, one record per hour ending in the current hour.
        let n = values.len() as i64;
        for (i, &v) in values.iter().enumerate() {
            let ts = hours_ago(n - 1 - i as i64) - Duration::minutes(5);
            store
                .append(RawSignalRecord::scalar(entity, SignalType::Mood, v, ts, "feed"))
                .unwrap();
        }
    }

    #[test]
    fn series_is_windowed_and_bucketed() {
        let store = Arc::new(MemoryRecordStore::new());
        mood_series(&store, "north", &[60.0, 62.0, 64.0, 66.0]);
        store
            .append(RawSignalRecord::scalar("north", SignalType::Mood, 10.0, hours_ago(30), "feed"))
            .unwrap();
        let svc = service(store);

        let series = svc.get_series("north", SignalType::Mood, 24).unwrap();
        assert_eq!(series.len(), 4);
        assert_eq!(series[3].mean, 66.0);
        assert!(series.windows(2).all(|w| w[0].start < w[1].start));
        assert!(svc.get_series("south", SignalType::Mood, 24).unwrap().is_empty());
    }

    #[test]
    fn oversized_window_saturates_instead_of_overflowing() {
        let store = Arc::new(MemoryRecordStore::new());
        mood_series(&store, "north", &[60.0, 62.0, 64.0]);
        let svc = service(store);

        let series = svc.get_series("north", SignalType::Mood, u32::MAX).unwrap();
        assert_eq!(series.len(), 3);
        let report = svc.get_anomalies(None, 3_000_000_000).unwrap();
        assert_eq!(report.anomaly_count, 0);
        assert_eq!(svc.anomaly_summary(u32::MAX).unwrap().total_anomalies, 0);
    }

    #[test]
    fn anomalies_report_totals() {
        let store = Arc::new(MemoryRecordStore::new());
        mood_series(&store, "north", &[80.0, 82.0, 20.0, 81.0, 79.0, 80.0, 81.0]);
        for (i, v) in [10.0, 20.0, 500.0].into_iter().enumerate() {
            let ts = hours_ago(2) + Duration::minutes(i as i64);
            store
                .append(RawSignalRecord::scalar("south", SignalType::Pm25, v, ts, "sensor"))
                .unwrap();
        }
        let svc = service(store);

        let report = svc.get_anomalies(None, 24).unwrap();
        assert_eq!(report.total_data_points, 10);
        assert_eq!(report.anomaly_count, 2);
        assert_eq!(report.statistical_count, 1);
        assert_eq!(report.range_count, 1);

        let north = svc.get_anomalies(Some("north"), 24).unwrap();
        assert_eq!(north.anomaly_count, 1);
        assert_eq!(north.entity.as_deref(), Some("north"));

        let summary = svc.anomaly_summary(24).unwrap();
        assert_eq!(summary.total_anomalies, 2);
        assert_eq!(summary.severity_distribution[&Severity::Medium], 2);
        assert_eq!(summary.severity_distribution[&Severity::High], 0);
        let top: Vec<&str> = summary.top_entities.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(top, vec!["north", "south"]);
    }

    #[test]
    fn top_entities_capped_at_five() {
        let store = Arc::new(MemoryRecordStore::new());
        for zone in ["z1", "z2", "z3", "z4", "z5", "z6"] {
            for (i, v) in [500.0, 600.0, 700.0].into_iter().enumerate() {
                let ts = hours_ago(1) + Duration::minutes(i as i64);
                store
                    .append(RawSignalRecord::scalar(zone, SignalType::NoiseLevel, v, ts, "mic"))
                    .unwrap();
            }
        }
        let summary = service(store).anomaly_summary(24).unwrap();
        assert_eq!(summary.total_anomalies, 6);
        assert_eq!(summary.severity_distribution[&Severity::High], 6);
        assert_eq!(summary.top_entities.len(), TOP_ENTITIES);
        assert_eq!(summary.top_entities[0].entity_id, "z1");
    }

    #[test]
    fn forecast_uses_mood_history() {
        let store = Arc::new(MemoryRecordStore::new());
        mood_series(&store, "north", &[50.0, 52.0, 54.0, 56.0, 58.0]);
        let svc = service(store);

        let points = svc.get_forecast("north", 6).unwrap();
        assert_eq!(points.len(), 6);
        assert_eq!(points[0].method, ForecastMethod::Regression);
        assert_eq!(points[0].timestamp, truncate_to_hour(now()) + Duration::hours(1));
        assert!(svc.get_forecast("nobody", 6).unwrap().is_empty());
    }

    #[test]
    fn city_forecast_averages_entities() {
        let store = Arc::new(MemoryRecordStore::new());
        mood_series(&store, "north", &[40.0, 40.0, 40.0]);
        mood_series(&store, "south", &[80.0, 80.0, 80.0]);
        let svc = service(store);

        let city = svc.city_forecast(3).unwrap();
        assert_eq!(city.entities, 2);
        assert_eq!(city.steps.len(), 3);
        for step in &city.steps {
            assert!((step.city_average - 60.0).abs() < 1e-9);
            assert_eq!(step.entity_predictions.len(), 2);
        }
    }

    #[test]
    fn current_pulse_defaults_quiet_entities_to_neutral() {
        let store = Arc::new(MemoryRecordStore::new());
        let happy = EmotionScores { joy: 0.9, neutral: 0.1, ..Default::default() };
        let sad = EmotionScores { sadness: 0.8, neutral: 0.2, ..Default::default() };
        for (m, scores) in [(10, happy), (20, happy), (25, sad)] {
            store
                .append(RawSignalRecord::mood("north", scores, now() - Duration::minutes(m), "feed"))
                .unwrap();
        }
        // South is known to the store but has nothing in the last hour.
        store
            .append(RawSignalRecord::mood("south", sad, hours_ago(5), "feed"))
            .unwrap();
        let svc = service(store);

        let pulse = svc.current_pulse().unwrap();
        assert_eq!(pulse.total_entities, 2);
        let north = &pulse.entities[0];
        assert_eq!(north.post_count, 3);
        assert_eq!(north.dominant_emotion, "joy");
        let expected = (100.0 + 100.0 + 20.0) / 3.0;
        assert!((north.mood_index - expected).abs() < 1e-9);

        let south = &pulse.entities[1];
        assert_eq!(south.mood_index, NEUTRAL_MOOD);
        assert_eq!(south.post_count, 0);
        assert_eq!(south.dominant_emotion, NEUTRAL_EMOTION);
        assert!((pulse.city_mood_index - (expected + 50.0) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn empty_store_pulse_is_neutral() {
        let pulse = service(Arc::new(MemoryRecordStore::new())).current_pulse().unwrap();
        assert_eq!(pulse.city_mood_index, NEUTRAL_MOOD);
        assert!(pulse.entities.is_empty());
    }

    #[test]
    fn environment_overview_averages_physical_signals() {
        let store = Arc::new(MemoryRecordStore::new());
        for (signal, v) in [
            (SignalType::Pm25, 10.0),
            (SignalType::Pm25, 20.0),
            (SignalType::Temperature, 18.5),
            (SignalType::Mood, 70.0),
        ] {
            store
                .append(RawSignalRecord::scalar("north", signal, v, now() - Duration::minutes(15), "s"))
                .unwrap();
        }
        store
            .append(RawSignalRecord::scalar("south", SignalType::Pm25, 90.0, now() - Duration::minutes(5), "s"))
            .unwrap();
        let svc = service(store);

        let overview = svc.environment_overview(Some("north")).unwrap();
        assert_eq!(overview.signals.len(), 2);
        let pm = overview.signals.iter().find(|s| s.signal == SignalType::Pm25).unwrap();
        assert_eq!(pm.average_value, 15.0);
        assert_eq!(pm.count, 2);

        let all = svc.environment_overview(None).unwrap();
        let pm = all.signals.iter().find(|s| s.signal == SignalType::Pm25).unwrap();
        assert_eq!(pm.count, 3);
        assert_eq!(pm.average_value, 40.0);
    }

    #[test]
    fn store_failures_surface_to_caller() {
        let store = Arc::new(MemoryRecordStore::new());
        store.set_available(false);
        let svc = service(store);
        assert!(matches!(
            svc.get_series("north", SignalType::Mood, 24),
            Err(StoreError::Unavailable(_))
        ));
        assert!(svc.current_pulse().is_err());
    }

    #[test]
    fn health_and_status_come_from_scheduler() {
        let svc = service(Arc::new(MemoryRecordStore::new()));
        assert!(svc.job_status().is_empty());
        let health = svc.health();
        assert!(health.healthy);
        assert!(!health.running);
        assert_eq!(health.timestamp, now());
    }
}
