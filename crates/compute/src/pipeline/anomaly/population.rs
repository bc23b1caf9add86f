//! Population statistics over a flat series of values.
//!
//! Shared by the aggregator (per-bucket summaries) and the statistical
//! detector (series mean and standard deviation).

/// Mean and population standard deviation of a series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesStats {
    pub mean: f64,
    pub stddev: f64,
}

impl SeriesStats {
    /// `None` for an empty series.
    pub fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mean = mean(values);
        Some(Self {
            mean,
            stddev: population_stddev(values, mean),
        })
    }

    /// Whether the series has no usable spread for z-scoring.
    pub fn is_degenerate(&self) -> bool {
        self.stddev <= f64::EPSILON
    }

    /// z-score of `value`, or 0.0 for a degenerate series.
    pub fn z_score(&self, value: f64) -> f64 {
        if self.is_degenerate() {
            return 0.0;
        }
        (value - self.mean) / self.stddev
    }
}

/// Arithmetic mean, summed in input order. Returns 0.0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population (divide-by-n) standard deviation around a precomputed mean.
pub fn population_stddev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}
