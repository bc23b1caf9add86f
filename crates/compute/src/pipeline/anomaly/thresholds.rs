//! Valid-range table for physical signals.
//!
//! Built-in ranges follow EPA short-term standards for pollutants and
//! plausibility bounds for weather and noise. A YAML file can override any
//! subset:
//!
//! ```yaml
//! ranges:
//!   pm25: { min: 0, max: 35 }
//!   noise_level: { min: 30, max: 85 }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use pulse_core::{ConfigError, SignalType};

/// Inclusive valid range; values outside it are anomalous.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// YAML document shape for range overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeTableFile {
    #[serde(default)]
    pub ranges: BTreeMap<SignalType, ValueRange>,
}

/// Typed range table keyed by signal subtype. Loaded once, then read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeTable {
    ranges: BTreeMap<SignalType, ValueRange>,
}

impl Default for RangeTable {
    fn default() -> Self {
        let ranges = [
            (SignalType::AirQuality, ValueRange::new(0.0, 150.0)),
            (SignalType::Pm25, ValueRange::new(0.0, 150.0)),
            (SignalType::Pm10, ValueRange::new(0.0, 150.0)),
            (SignalType::Ozone, ValueRange::new(0.0, 70.0)),
            (SignalType::No2, ValueRange::new(0.0, 100.0)),
            (SignalType::Co, ValueRange::new(0.0, 9.0)),
            (SignalType::So2, ValueRange::new(0.0, 75.0)),
            (SignalType::Temperature, ValueRange::new(-20.0, 45.0)),
            (SignalType::Humidity, ValueRange::new(0.0, 100.0)),
            (SignalType::Pressure, ValueRange::new(900.0, 1100.0)),
            (SignalType::WindSpeed, ValueRange::new(0.0, 50.0)),
            (SignalType::Visibility, ValueRange::new(0.0, 50.0)),
            (SignalType::NoiseLevel, ValueRange::new(30.0, 120.0)),
            (SignalType::Precipitation, ValueRange::new(0.0, 50.0)),
            (SignalType::UvIndex, ValueRange::new(0.0, 11.0)),
        ]
        .into_iter()
        .collect();
        Self { ranges }
    }
}

impl RangeTable {
    pub fn get(&self, signal: SignalType) -> Option<ValueRange> {
        self.ranges.get(&signal).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SignalType, ValueRange)> + '_ {
        self.ranges.iter().map(|(s, r)| (*s, *r))
    }

    /// Replace or add the range for one signal.
    pub fn set(&mut self, signal: SignalType, range: ValueRange) -> Result<(), ConfigError> {
        validate(signal, range)?;
        self.ranges.insert(signal, range);
        Ok(())
    }

    /// Built-in table with overrides from a YAML string applied.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let file: RangeTableFile =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut table = Self::default();
        for (signal, range) in file.ranges {
            table.set(signal, range)?;
        }
        Ok(table)
    }

    /// Built-in table with overrides from a YAML file applied.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let table = Self::from_yaml_str(&yaml)?;
        info!(path = %path.display(), signals = table.ranges.len(), "loaded range table");
        Ok(table)
    }
}

fn validate(signal: SignalType, range: ValueRange) -> Result<(), ConfigError> {
    if range.min.is_nan() || range.max.is_nan() || range.min > range.max {
        return Err(ConfigError::InvalidRange {
            signal: signal.to_string(),
            min: range.min,
            max: range.max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_covers_every_physical_signal() {
        let table = RangeTable::default();
        for signal in SignalType::ALL {
            if signal.family() == pulse_core::SignalFamily::Physical {
                assert!(table.get(signal).is_some(), "missing range for {signal}");
            }
        }
        assert!(table.get(SignalType::Mood).is_none());
    }

    #[test]
    fn range_is_inclusive() {
        let r = ValueRange::new(0.0, 150.0);
        assert!(r.contains(0.0));
        assert!(r.contains(150.0));
        assert!(!r.contains(150.01));
        assert!(!r.contains(-0.5));
    }

    #[test]
    fn yaml_overrides_merge_onto_builtin() {
        let table = RangeTable::from_yaml_str(
            "ranges:\n  pm25: { min: 0, max: 35 }\n  noise_level: { min: 30, max: 85 }\n",
        )
        .unwrap();
        assert_eq!(table.get(SignalType::Pm25), Some(ValueRange::new(0.0, 35.0)));
        assert_eq!(table.get(SignalType::NoiseLevel), Some(ValueRange::new(30.0, 85.0)));
        assert_eq!(table.get(SignalType::Ozone), Some(ValueRange::new(0.0, 70.0)));
    }

    #[test]
    fn inverted_range_rejected() {
        let err = RangeTable::from_yaml_str("ranges:\n  co: { min: 10, max: 1 }\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRange { .. }));
    }

    #[test]
    fn unknown_fields_rejected() {
        let err = RangeTable::from_yaml_str("ranges:\n  co: { low: 0, max: 1 }\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ranges:\n  ozone: {{ min: 0, max: 50 }}").unwrap();
        let table = RangeTable::from_file(file.path()).unwrap();
        assert_eq!(table.get(SignalType::Ozone), Some(ValueRange::new(0.0, 50.0)));
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = RangeTable::from_file(Path::new("/nonexistent/ranges.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::File { .. }));
    }
}
