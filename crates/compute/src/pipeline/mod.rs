//! Read-side analytics pipeline.
//!
//! Raw records flow through three pure stages:
//!
//! - **aggregate**: hourly [`TimeBucket`]s per entity + signal.
//! - **anomaly**: statistical or range-bound flags on those buckets.
//! - **forecast**: short-horizon projection of one bucket series.
//!
//! None of the stages hold state, so any of them can run concurrently
//! across entities and windows.

pub mod aggregate;
pub mod anomaly;
pub mod forecast;

pub use aggregate::{bucket, split_series, truncate_to_hour, TimeBucket};
pub use anomaly::{
    AnomalyDetector, AnomalyFlag, AnomalyReason, DetectorPolicy, RangeTable, Severity, ValueRange,
};
pub use forecast::{ForecastMethod, ForecastPoint, Forecaster};
