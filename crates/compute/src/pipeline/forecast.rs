//! Short-horizon forecasting over an hourly bucket series.
//!
//! Primary method: ordinary least squares on two features per bucket,
//! `[hours since first bucket, previous bucket value]`. The first bucket
//! uses its own value as its lag. Series shorter than three buckets, or
//! fits that cannot be solved, fall back to a last-three-points trend.
//!
//! `forecast()` never fails: every error is absorbed into the fallback.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use pulse_core::{EntityId, SignalType};

use super::aggregate::TimeBucket;

/// Confidence attached to regression predictions.
pub const REGRESSION_CONFIDENCE: f64 = 0.7;
/// Confidence attached to trend-fallback predictions.
pub const TREND_CONFIDENCE: f64 = 0.5;
/// Minimum buckets before the regression path is attempted.
pub const MIN_REGRESSION_POINTS: usize = 3;

/// Relative tolerance below which a feature or the normal matrix is treated as degenerate.
const DEGENERATE_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastMethod {
    Regression,
    Trend,
}

/// A projected value for one future hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub entity_id: EntityId,
    pub signal: SignalType,
    pub timestamp: DateTime<Utc>,
    /// Clipped to the signal's valid domain.
    pub predicted: f64,
    pub confidence: f64,
    pub method: ForecastMethod,
}

#[derive(Debug, Error, PartialEq)]
pub enum ForecastError {
    #[error("need at least {needed} buckets, got {got}")]
    TooFewPoints { needed: usize, got: usize },

    #[error("regression system is singular")]
    Singular,

    #[error("regression produced a non-finite {0}")]
    NonFinite(&'static str),
}

/// Fitted model `y = intercept + b_time * t + b_lag * lag`, stored centered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LagRegression {
    mean_time: f64,
    mean_lag: f64,
    mean_y: f64,
    b_time: f64,
    b_lag: f64,
}

impl LagRegression {
    /// Fit on `(t, lag) -> y` triples.
    pub fn fit(time: &[f64], lag: &[f64], y: &[f64]) -> Result<Self, ForecastError> {
        let n = y.len();
        if n < MIN_REGRESSION_POINTS || time.len() != n || lag.len() != n {
            return Err(ForecastError::TooFewPoints {
                needed: MIN_REGRESSION_POINTS,
                got: n,
            });
        }
        let nf = n as f64;
        let mean_time = time.iter().sum::<f64>() / nf;
        let mean_lag = lag.iter().sum::<f64>() / nf;
        let mean_y = y.iter().sum::<f64>() / nf;

        let (mut stt, mut sll, mut stl, mut sty, mut sly) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for i in 0..n {
            let dt = time[i] - mean_time;
            let dl = lag[i] - mean_lag;
            let dy = y[i] - mean_y;
            stt += dt * dt;
            sll += dl * dl;
            stl += dt * dl;
            sty += dt * dy;
            sly += dl * dy;
        }

        let time_flat = stt <= DEGENERATE_TOLERANCE;
        let lag_flat = sll <= DEGENERATE_TOLERANCE * (1.0 + mean_lag * mean_lag);

        let (b_time, b_lag) = match (time_flat, lag_flat) {
            (true, true) => (0.0, 0.0),
            (false, true) => (sty / stt, 0.0),
            (true, false) => (0.0, sly / sll),
            (false, false) => {
                let det = stt * sll - stl * stl;
                if det.abs() <= DEGENERATE_TOLERANCE * stt * sll {
                    return Err(ForecastError::Singular);
                }
                // Cramer's rule on the 2x2 normal equations.
                ((sty * sll - sly * stl) / det, (stt * sly - stl * sty) / det)
            }
        };

        if !b_time.is_finite() || !b_lag.is_finite() {
            return Err(ForecastError::NonFinite("coefficient"));
        }

        Ok(Self {
            mean_time,
            mean_lag,
            mean_y,
            b_time,
            b_lag,
        })
    }

    pub fn predict(&self, time: f64, lag: f64) -> Result<f64, ForecastError> {
        let y = self.mean_y + self.b_time * (time - self.mean_time) + self.b_lag * (lag - self.mean_lag);
        if y.is_finite() {
            Ok(y)
        } else {
            Err(ForecastError::NonFinite("prediction"))
        }
    }

    pub fn coefficients(&self) -> (f64, f64) {
        (self.b_time, self.b_lag)
    }
}

/// Stateless forecaster; one instance can serve every series concurrently.
#[derive(Debug, Clone, Copy, Default)]
pub struct Forecaster;

impl Forecaster {
    pub fn new() -> Self {
        Self
    }

    /// Project `hours_ahead` hourly points past the last bucket of `series`.
    ///
    /// `series` must be a single entity + signal ordered by start. An empty
    /// series or a zero horizon yields no points.
    pub fn forecast(&self, series: &[TimeBucket], hours_ahead: u32) -> Vec<ForecastPoint> {
        if series.is_empty() || hours_ahead == 0 {
            return Vec::new();
        }

        let (predictions, confidence, method) = match self.regression(series, hours_ahead) {
            Ok(p) => (p, REGRESSION_CONFIDENCE, ForecastMethod::Regression),
            Err(e) => {
                debug!(
                    entity = %series[0].entity_id,
                    signal = %series[0].signal,
                    buckets = series.len(),
                    reason = %e,
                    "forecast falling back to trend"
                );
                (trend_projection(series, hours_ahead), TREND_CONFIDENCE, ForecastMethod::Trend)
            }
        };

        let last = &series[series.len() - 1];
        predictions
            .into_iter()
            .zip(1..=i64::from(hours_ahead))
            .map(|(value, h)| ForecastPoint {
                entity_id: last.entity_id.clone(),
                signal: last.signal,
                timestamp: last.start + Duration::hours(h),
                predicted: last.signal.clip(value),
                confidence,
                method,
            })
            .collect()
    }

    fn regression(&self, series: &[TimeBucket], hours_ahead: u32) -> Result<Vec<f64>, ForecastError> {
        if series.len() < MIN_REGRESSION_POINTS {
            return Err(ForecastError::TooFewPoints {
                needed: MIN_REGRESSION_POINTS,
                got: series.len(),
            });
        }

        let first = series[0].start;
        let time: Vec<f64> = series.iter().map(|b| hours_between(first, b.start)).collect();
        let y: Vec<f64> = series.iter().map(|b| b.mean).collect();
        let lag: Vec<f64> = std::iter::once(y[0]).chain(y.iter().copied()).take(y.len()).collect();

        let model = LagRegression::fit(&time, &lag, &y)?;

        let last = &series[series.len() - 1];
        (1..=i64::from(hours_ahead))
            .map(|h| model.predict(hours_between(first, last.start + Duration::hours(h)), last.mean))
            .collect()
    }
}

/// Trend over the last (up to) three buckets, projected linearly.
fn trend_projection(series: &[TimeBucket], hours_ahead: u32) -> Vec<f64> {
    let tail = &series[series.len().saturating_sub(3)..];
    let last = tail[tail.len() - 1].mean;
    let trend = if tail.len() > 1 {
        (last - tail[0].mean) / (tail.len() - 1) as f64
    } else {
        0.0
    };
    (1..=hours_ahead).map(|h| last + trend * f64::from(h)).collect()
}

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / 3600.0
}
