//! Hourly time-bucket aggregation of raw signal records.
//!
//! Buckets are derived data: recomputed on every read from the raw records
//! and never stored. Output is ordered by (entity, signal, start), so every
//! per-series slice is strictly increasing in start time.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use pulse_core::{EntityId, RawSignalRecord, SignalType};

use super::anomaly::population::{mean, population_stddev};

/// Truncate a timestamp to the top of its hour.
pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp().rem_euclid(3600);
    ts - Duration::seconds(secs) - Duration::nanoseconds(i64::from(ts.timestamp_subsec_nanos()))
}

/// Summary of one entity + signal over one hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeBucket {
    pub entity_id: EntityId,
    pub signal: SignalType,
    /// Hour-truncated start of the bucket.
    pub start: DateTime<Utc>,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
    pub sample_count: usize,
    /// Per-category means for distribution signals; empty for scalars.
    pub components: BTreeMap<String, f64>,
    /// Number of records whose dominant category is the key.
    pub category_counts: BTreeMap<String, usize>,
    /// Category with the most records in the bucket.
    pub dominant: Option<String>,
    /// Raw per-record scores in record order.
    #[serde(skip)]
    pub samples: Vec<f64>,
}

impl TimeBucket {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::hours(1)
    }
}

type BucketKey = (EntityId, SignalType, DateTime<Utc>);

#[derive(Default)]
struct Accumulator {
    samples: Vec<f64>,
    component_sums: BTreeMap<String, (f64, usize)>,
    category_counts: BTreeMap<String, usize>,
}

impl Accumulator {
    fn push(&mut self, record: &RawSignalRecord) {
        self.samples.push(record.score());
        if let Some(components) = record.value.components() {
            for (name, weight) in components {
                let slot = self.component_sums.entry(name.clone()).or_insert((0.0, 0));
                slot.0 += weight;
                slot.1 += 1;
            }
        }
        if let Some(dominant) = record.value.dominant() {
            *self.category_counts.entry(dominant.to_string()).or_default() += 1;
        }
    }

    fn finish(self, (entity_id, signal, start): BucketKey) -> TimeBucket {
        let mean = mean(&self.samples);
        let stddev = population_stddev(&self.samples, mean);
        let min = self.samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let components = self
            .component_sums
            .into_iter()
            .map(|(name, (sum, n))| (name, sum / n as f64))
            .collect();

        // Highest post count wins; BTreeMap order makes ties go to the smallest name.
        let mut dominant: Option<(&String, usize)> = None;
        for (name, &count) in &self.category_counts {
            match dominant {
                Some((_, best)) if count <= best => {}
                _ => dominant = Some((name, count)),
            }
        }
        let dominant = dominant.map(|(name, _)| name.clone());

        TimeBucket {
            entity_id,
            signal,
            start,
            mean,
            min,
            max,
            stddev,
            sample_count: self.samples.len(),
            components,
            category_counts: self.category_counts,
            dominant,
            samples: self.samples,
        }
    }
}

/// Group records in `[window_start, window_end)` into hourly buckets.
///
/// Records must be in timestamp order for `samples` to be reproducible;
/// the bucket statistics themselves only depend on the record set order
/// within each bucket. Empty hours produce no bucket.
pub fn bucket(
    records: &[RawSignalRecord],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Vec<TimeBucket> {
    let mut groups: BTreeMap<BucketKey, Accumulator> = BTreeMap::new();
    let mut included = 0usize;

    for record in records {
        if record.timestamp < window_start || record.timestamp >= window_end {
            continue;
        }
        included += 1;
        let key = (
            record.entity_id.clone(),
            record.signal,
            truncate_to_hour(record.timestamp),
        );
        groups.entry(key).or_default().push(record);
    }

    let buckets: Vec<TimeBucket> = groups
        .into_iter()
        .map(|(key, acc)| acc.finish(key))
        .collect();

    debug!(
        records = records.len(),
        included,
        buckets = buckets.len(),
        "bucketed records"
    );

    buckets
}

/// Split a bucket list into per-(entity, signal) series, each ordered by start.
pub fn split_series(buckets: Vec<TimeBucket>) -> BTreeMap<(EntityId, SignalType), Vec<TimeBucket>> {
    let mut series: BTreeMap<(EntityId, SignalType), Vec<TimeBucket>> = BTreeMap::new();
    for b in buckets {
        series
            .entry((b.entity_id.clone(), b.signal))
            .or_default()
            .push(b);
    }
    series
}
