//! Anomaly detection over hourly buckets.
//!
//! Two strategies, chosen by [`SignalFamily`]:
//! - **Statistical** (index signals such as mood): z-score of each bucket
//!   mean against the mean/stddev of the whole series.
//! - **Range-bound** (physical signals): every raw sample in a bucket is
//!   checked against the signal's fixed valid range.
//!
//! Flags are always attached to the hour bucket and carry its mean value,
//! even though severity is derived from the underlying raw samples.
//!
//! Sub-modules:
//! - [`population`] — series mean / standard deviation
//! - [`thresholds`] — per-signal valid-range table

pub mod population;
pub mod thresholds;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pulse_core::config::AnalyticsSettings;
use pulse_core::{ConfigError, EntityId, SignalFamily, SignalType};

use super::aggregate::{split_series, TimeBucket};
pub use population::SeriesStats;
pub use thresholds::{RangeTable, ValueRange};

/// Default |z| above which a bucket is anomalous.
pub const DEFAULT_Z_THRESHOLD: f64 = 2.0;

/// Anomaly severity, a pure function of the flagged fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Why a bucket was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyReason {
    /// Bucket mean deviates from the series by more than the z threshold.
    MoodSpike,
    /// One or more samples fell outside the signal's valid range.
    ThresholdExceeded,
}

/// An anomalous hour for one entity + signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFlag {
    pub entity_id: EntityId,
    pub signal: SignalType,
    pub bucket_start: DateTime<Utc>,
    /// Bucket mean, for display.
    pub value: f64,
    pub sample_count: usize,
    pub flagged_count: usize,
    pub flagged_fraction: f64,
    pub severity: Severity,
    pub reason: AnomalyReason,
    /// z-score of the bucket mean (statistical strategy only).
    pub z_score: Option<f64>,
    /// Range the samples were tested against (range strategy only).
    pub valid_range: Option<ValueRange>,
}

/// Thresholds that turn raw test results into flags and severities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorPolicy {
    pub z_threshold: f64,
    /// Flagged fraction above which a statistical anomaly is `Medium` (else `Low`).
    pub medium_fraction: f64,
    /// Flagged fraction above which a range anomaly is `High` (else `Medium`).
    pub high_fraction: f64,
    /// Minimum buckets (statistical) or samples per bucket (range).
    pub min_samples: usize,
}

impl Default for DetectorPolicy {
    fn default() -> Self {
        Self {
            z_threshold: DEFAULT_Z_THRESHOLD,
            medium_fraction: 0.5,
            high_fraction: 0.7,
            min_samples: 3,
        }
    }
}

impl DetectorPolicy {
    pub fn from_settings(settings: &AnalyticsSettings) -> Result<Self, ConfigError> {
        let policy = Self {
            z_threshold: settings.z_threshold,
            medium_fraction: settings.mood_medium_fraction,
            high_fraction: settings.range_high_fraction,
            min_samples: settings.min_samples,
        };
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.z_threshold.is_finite() && self.z_threshold > 0.0) {
            return Err(ConfigError::InvalidThreshold {
                name: "z_threshold".to_string(),
                value: self.z_threshold,
            });
        }
        for (name, value) in [
            ("medium_fraction", self.medium_fraction),
            ("high_fraction", self.high_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidThreshold {
                    name: name.to_string(),
                    value,
                });
            }
        }
        Ok(())
    }

    fn statistical_severity(&self, fraction: f64) -> Severity {
        if fraction > self.medium_fraction {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    fn range_severity(&self, fraction: f64) -> Severity {
        if fraction > self.high_fraction {
            Severity::High
        } else {
            Severity::Medium
        }
    }
}

/// Per-point z-score test. Fewer than `min_points` values or a zero stddev
/// yields no anomalies.
pub fn z_score_flags(values: &[f64], threshold: f64, min_points: usize) -> Vec<bool> {
    let stats = match SeriesStats::of(values) {
        Some(s) if values.len() >= min_points && !s.is_degenerate() => s,
        _ => return vec![false; values.len()],
    };
    values
        .iter()
        .map(|&v| stats.z_score(v).abs() > threshold)
        .collect()
}

/// Per-sample range test.
pub fn range_flags(values: &[f64], range: ValueRange) -> Vec<bool> {
    values.iter().map(|&v| !range.contains(v)).collect()
}

/// Stateless detector; safe to share across threads.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    policy: DetectorPolicy,
    ranges: RangeTable,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(DetectorPolicy::default(), RangeTable::default())
    }
}

impl AnomalyDetector {
    pub fn new(policy: DetectorPolicy, ranges: RangeTable) -> Self {
        Self { policy, ranges }
    }

    /// Build from settings, loading the range table file if one is configured.
    pub fn from_settings(settings: &AnalyticsSettings) -> Result<Self, ConfigError> {
        let policy = DetectorPolicy::from_settings(settings)?;
        let ranges = match &settings.thresholds_file {
            Some(path) => RangeTable::from_file(path)?,
            None => RangeTable::default(),
        };
        Ok(Self::new(policy, ranges))
    }

    pub fn policy(&self) -> &DetectorPolicy {
        &self.policy
    }

    pub fn ranges(&self) -> &RangeTable {
        &self.ranges
    }

    /// Detect anomalies across any mix of buckets. Series are evaluated in
    /// parallel; output is ordered by (entity, signal, bucket start).
    pub fn detect(&self, buckets: Vec<TimeBucket>) -> Vec<AnomalyFlag> {
        let series: Vec<Vec<TimeBucket>> = split_series(buckets).into_values().collect();
        let flags: Vec<AnomalyFlag> = series
            .par_iter()
            .flat_map_iter(|s| self.detect_series(s))
            .collect();
        debug!(series = series.len(), flags = flags.len(), "anomaly detection complete");
        flags
    }

    /// Detect anomalies in a single entity + signal series ordered by start.
    pub fn detect_series(&self, series: &[TimeBucket]) -> Vec<AnomalyFlag> {
        let Some(first) = series.first() else {
            return Vec::new();
        };
        match first.signal.family() {
            SignalFamily::Index => self.detect_statistical(series),
            SignalFamily::Physical => self.detect_range(series),
        }
    }

    fn detect_statistical(&self, series: &[TimeBucket]) -> Vec<AnomalyFlag> {
        let threshold = self.policy.z_threshold;
        let means: Vec<f64> = series.iter().map(|b| b.mean).collect();
        let stats = match SeriesStats::of(&means) {
            Some(s) if means.len() >= self.policy.min_samples && !s.is_degenerate() => s,
            _ => return Vec::new(),
        };

        series
            .iter()
            .filter_map(|b| {
                let z = stats.z_score(b.mean);
                if z.abs() <= threshold {
                    return None;
                }
                let fallback = [b.mean];
                let samples: &[f64] = if b.samples.is_empty() { &fallback } else { &b.samples };
                let flagged = samples
                    .iter()
                    .filter(|&&v| stats.z_score(v).abs() > threshold)
                    .count();
                let fraction = flagged as f64 / samples.len() as f64;
                Some(AnomalyFlag {
                    entity_id: b.entity_id.clone(),
                    signal: b.signal,
                    bucket_start: b.start,
                    value: b.mean,
                    sample_count: b.sample_count,
                    flagged_count: flagged,
                    flagged_fraction: fraction,
                    severity: self.policy.statistical_severity(fraction),
                    reason: AnomalyReason::MoodSpike,
                    z_score: Some(z),
                    valid_range: None,
                })
            })
            .collect()
    }

    fn detect_range(&self, series: &[TimeBucket]) -> Vec<AnomalyFlag> {
        series
            .iter()
            .filter_map(|b| {
                let range = self.ranges.get(b.signal)?;
                if b.samples.len() < self.policy.min_samples {
                    return None;
                }
                let flagged = range_flags(&b.samples, range).into_iter().filter(|f| *f).count();
                if flagged == 0 {
                    return None;
                }
                let fraction = flagged as f64 / b.samples.len() as f64;
                Some(AnomalyFlag {
                    entity_id: b.entity_id.clone(),
                    signal: b.signal,
                    bucket_start: b.start,
                    value: b.mean,
                    sample_count: b.sample_count,
                    flagged_count: flagged,
                    flagged_fraction: fraction,
                    severity: self.policy.range_severity(fraction),
                    reason: AnomalyReason::ThresholdExceeded,
                    z_score: None,
                    valid_range: Some(range),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::aggregate::bucket;
    use chrono::{Duration, TimeZone};
    use pulse_core::RawSignalRecord;

    fn hour(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap() + Duration::hours(h)
    }

    /// One record per hour, 10 minutes past.
    fn hourly(entity: &str, signal: SignalType, values: &[f64]) -> Vec<RawSignalRecord> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                RawSignalRecord::scalar(
                    entity,
                    signal,
                    v,
                    hour(i as i64) + Duration::minutes(10),
                    "test",
                )
            })
            .collect()
    }

    fn buckets_of(records: &[RawSignalRecord]) -> Vec<TimeBucket> {
        bucket(records, hour(0), hour(48))
    }

    #[test]
    fn z_flags_need_three_points() {
        assert_eq!(z_score_flags(&[1.0, 100.0], 2.0, 3), vec![false, false]);
        assert!(z_score_flags(&[], 2.0, 3).is_empty());
    }

    #[test]
    fn z_flags_zero_stddev_is_quiet() {
        assert_eq!(z_score_flags(&[5.0, 5.0, 5.0, 5.0], 2.0, 3), vec![false; 4]);
    }

    #[test]
    fn z_flags_population_stddev() {
        // mean 68.4, population stddev ~24.22: the 20 sits at |z| ~1.998.
        let flags = z_score_flags(&[80.0, 82.0, 20.0, 81.0, 79.0], 2.0, 3);
        assert_eq!(flags, vec![false; 5]);
        let flags = z_score_flags(&[80.0, 82.0, 20.0, 81.0, 79.0], 1.9, 3);
        assert_eq!(flags, vec![false, false, true, false, false]);
    }

    #[test]
    fn mood_drop_flagged_at_default_threshold() {
        // mean ~71.86, stddev ~21.19: the 20 sits at |z| ~2.45.
        let records = hourly("zone-1", SignalType::Mood, &[80.0, 82.0, 20.0, 81.0, 79.0, 80.0, 81.0]);
        let flags = AnomalyDetector::default().detect(buckets_of(&records));

        assert_eq!(flags.len(), 1);
        let f = &flags[0];
        assert_eq!(f.bucket_start, hour(2));
        assert_eq!(f.value, 20.0);
        assert_eq!(f.reason, AnomalyReason::MoodSpike);
        assert!(f.z_score.unwrap() < -2.0);
        assert_eq!(f.flagged_fraction, 1.0);
        assert_eq!(f.severity, Severity::Medium);
    }

    #[test]
    fn statistical_severity_low_when_few_samples_deviate() {
        // Hour 2 averages low because of one extreme post among several normal ones.
        let mut records = hourly("z", SignalType::Mood, &[80.0, 81.0, 79.0, 80.0, 82.0, 78.0, 80.0, 81.0]);
        for v in [0.0, 0.0, 60.0, 62.0, 61.0] {
            records.push(RawSignalRecord::scalar("z", SignalType::Mood, v, hour(8) + Duration::minutes(20), "t"));
        }
        records.sort_by_key(|r| r.timestamp);

        let flags = AnomalyDetector::default().detect(buckets_of(&records));
        assert_eq!(flags.len(), 1);
        let f = &flags[0];
        assert_eq!(f.bucket_start, hour(8));
        assert_eq!(f.sample_count, 5);
        assert_eq!(f.flagged_count, 2);
        assert_eq!(f.severity, Severity::Low);
    }

    #[test]
    fn statistical_needs_three_buckets() {
        let records = hourly("z", SignalType::Mood, &[90.0, 10.0]);
        assert!(AnomalyDetector::default().detect(buckets_of(&records)).is_empty());
    }

    #[test]
    fn constant_mood_series_has_no_anomalies() {
        let records = hourly("z", SignalType::Mood, &[55.0; 6]);
        assert!(AnomalyDetector::default().detect(buckets_of(&records)).is_empty());
    }

    #[test]
    fn particulate_out_of_range_is_medium() {
        let records: Vec<RawSignalRecord> = [10.0, 20.0, 500.0]
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                RawSignalRecord::scalar("z", SignalType::Pm25, v, hour(3) + Duration::minutes(i as i64 * 5), "s")
            })
            .collect();

        let flags = AnomalyDetector::default().detect(buckets_of(&records));
        assert_eq!(flags.len(), 1);
        let f = &flags[0];
        assert_eq!(f.flagged_count, 1);
        assert!((f.flagged_fraction - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(f.severity, Severity::Medium);
        assert_eq!(f.reason, AnomalyReason::ThresholdExceeded);
        assert_eq!(f.valid_range, Some(ValueRange::new(0.0, 150.0)));
        assert!((f.value - 530.0 / 3.0).abs() < 1e-9);
        assert_eq!(range_flags(&[10.0, 20.0, 500.0], ValueRange::new(0.0, 150.0)), vec![false, false, true]);
    }

    #[test]
    fn mostly_out_of_range_is_high() {
        let records: Vec<RawSignalRecord> = [200.0, 300.0, 400.0, 10.0]
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                RawSignalRecord::scalar("z", SignalType::Pm10, v, hour(1) + Duration::minutes(i as i64), "s")
            })
            .collect();
        let flags = AnomalyDetector::default().detect(buckets_of(&records));
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].severity, Severity::High);
    }

    #[test]
    fn range_bucket_with_two_samples_not_evaluated() {
        let records = vec![
            RawSignalRecord::scalar("z", SignalType::NoiseLevel, 500.0, hour(1), "s"),
            RawSignalRecord::scalar("z", SignalType::NoiseLevel, 600.0, hour(1) + Duration::minutes(1), "s"),
        ];
        assert!(AnomalyDetector::default().detect(buckets_of(&records)).is_empty());
    }

    #[test]
    fn custom_policy_thresholds_apply() {
        let policy = DetectorPolicy { z_threshold: 1.9, ..Default::default() };
        let detector = AnomalyDetector::new(policy, RangeTable::default());
        let records = hourly("z", SignalType::Mood, &[80.0, 82.0, 20.0, 81.0, 79.0]);
        let flags = detector.detect(buckets_of(&records));
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].value, 20.0);
    }

    #[test]
    fn invalid_policy_rejected() {
        let settings = AnalyticsSettings { z_threshold: -1.0, ..Default::default() };
        assert!(DetectorPolicy::from_settings(&settings).is_err());
        let settings = AnalyticsSettings { range_high_fraction: 1.5, ..Default::default() };
        assert!(DetectorPolicy::from_settings(&settings).is_err());
    }

    #[test]
    fn flags_from_many_series_are_ordered() {
        let mut records = hourly("b", SignalType::Mood, &[80.0, 82.0, 20.0, 81.0, 79.0, 80.0, 81.0]);
        records.extend(hourly("a", SignalType::Mood, &[80.0, 82.0, 20.0, 81.0, 79.0, 80.0, 81.0]));
        records.sort_by_key(|r| r.timestamp);
        let flags = AnomalyDetector::default().detect(buckets_of(&records));
        let entities: Vec<&str> = flags.iter().map(|f| f.entity_id.as_str()).collect();
        assert_eq!(entities, vec!["a", "b"]);
    }
}
