use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Kind of measurement carried by a raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    /// Sentiment-derived mood index (0-100).
    Mood,
    /// Composite air quality index (AQI).
    AirQuality,
    Pm25,
    Pm10,
    Ozone,
    No2,
    Co,
    So2,
    Temperature,
    Humidity,
    Pressure,
    WindSpeed,
    Visibility,
    NoiseLevel,
    Precipitation,
    UvIndex,
}

/// Which anomaly strategy applies to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalFamily {
    /// Bounded 0-100 index semantics; tested statistically.
    Index,
    /// Physical measurement with a fixed valid range.
    Physical,
}

impl SignalType {
    pub const ALL: [SignalType; 16] = [
        SignalType::Mood,
        SignalType::AirQuality,
        SignalType::Pm25,
        SignalType::Pm10,
        SignalType::Ozone,
        SignalType::No2,
        SignalType::Co,
        SignalType::So2,
        SignalType::Temperature,
        SignalType::Humidity,
        SignalType::Pressure,
        SignalType::WindSpeed,
        SignalType::Visibility,
        SignalType::NoiseLevel,
        SignalType::Precipitation,
        SignalType::UvIndex,
    ];

    pub fn family(self) -> SignalFamily {
        match self {
            SignalType::Mood => SignalFamily::Index,
            _ => SignalFamily::Physical,
        }
    }

    /// Valid value domain `(min, max)`; forecasts are clipped to it.
    pub fn domain(self) -> (f64, f64) {
        match self {
            SignalType::Mood | SignalType::Humidity => (0.0, 100.0),
            SignalType::Temperature => (-90.0, 60.0),
            _ => (0.0, f64::INFINITY),
        }
    }

    /// Clamp `value` into [`SignalType::domain`].
    pub fn clip(self, value: f64) -> f64 {
        let (min, max) = self.domain();
        value.max(min).min(max)
    }

    pub fn unit(self) -> &'static str {
        match self {
            SignalType::Mood => "index",
            SignalType::AirQuality => "AQI",
            SignalType::Pm25 | SignalType::Pm10 => "ug/m3",
            SignalType::Ozone | SignalType::No2 | SignalType::So2 => "ppb",
            SignalType::Co => "ppm",
            SignalType::Temperature => "C",
            SignalType::Humidity => "%",
            SignalType::Pressure => "hPa",
            SignalType::WindSpeed => "m/s",
            SignalType::Visibility => "km",
            SignalType::NoiseLevel => "dB",
            SignalType::Precipitation => "mm/h",
            SignalType::UvIndex => "index",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Mood => "mood",
            SignalType::AirQuality => "air_quality",
            SignalType::Pm25 => "pm25",
            SignalType::Pm10 => "pm10",
            SignalType::Ozone => "ozone",
            SignalType::No2 => "no2",
            SignalType::Co => "co",
            SignalType::So2 => "so2",
            SignalType::Temperature => "temperature",
            SignalType::Humidity => "humidity",
            SignalType::Pressure => "pressure",
            SignalType::WindSpeed => "wind_speed",
            SignalType::Visibility => "visibility",
            SignalType::NoiseLevel => "noise_level",
            SignalType::Precipitation => "precipitation",
            SignalType::UvIndex => "uv_index",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            // Aliases used by upstream feeds.
            "o3" => return Ok(SignalType::Ozone),
            "db_level" | "noise" => return Ok(SignalType::NoiseLevel),
            _ => {}
        }
        SignalType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| ConfigError::UnknownSignal(s.to_string()))
    }
}

/// Value carried by a raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Scalar(f64),
    /// Weights over categories plus their scalar summary (e.g. emotions + mood index).
    Distribution {
        score: f64,
        components: BTreeMap<String, f64>,
    },
}

impl SignalValue {
    /// Scalar used for bucketing and anomaly tests.
    pub fn score(&self) -> f64 {
        match self {
            SignalValue::Scalar(v) => *v,
            SignalValue::Distribution { score, .. } => *score,
        }
    }

    pub fn components(&self) -> Option<&BTreeMap<String, f64>> {
        match self {
            SignalValue::Scalar(_) => None,
            SignalValue::Distribution { components, .. } => Some(components),
        }
    }

    /// Category with the highest weight. Ties go to the lexicographically smallest name.
    pub fn dominant(&self) -> Option<&str> {
        let components = self.components()?;
        let mut best: Option<(&str, f64)> = None;
        for (name, &weight) in components {
            match best {
                Some((_, w)) if weight <= w => {}
                _ => best = Some((name.as_str(), weight)),
            }
        }
        best.map(|(name, _)| name)
    }

    pub fn is_finite(&self) -> bool {
        match self {
            SignalValue::Scalar(v) => v.is_finite(),
            SignalValue::Distribution { score, components } => {
                score.is_finite() && components.values().all(|v| v.is_finite())
            }
        }
    }
}

/// Emotion classifier output for one post.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EmotionScores {
    pub joy: f64,
    pub sadness: f64,
    pub anger: f64,
    pub fear: f64,
    pub surprise: f64,
    pub disgust: f64,
    pub neutral: f64,
}

impl EmotionScores {
    pub const LABELS: [&'static str; 7] =
        ["joy", "sadness", "anger", "fear", "surprise", "disgust", "neutral"];

    fn values(&self) -> [f64; 7] {
        [
            self.joy,
            self.sadness,
            self.anger,
            self.fear,
            self.surprise,
            self.disgust,
            self.neutral,
        ]
    }

    /// Mood index in [0, 100]: positive (joy, neutral) minus negative emotions, rescaled.
    pub fn mood_index(&self) -> f64 {
        let positive = self.joy + self.neutral;
        let negative = self.anger + self.sadness + self.disgust + self.fear + self.surprise;
        ((positive - negative + 1.0) * 50.0).clamp(0.0, 100.0)
    }

    /// Highest-scoring label; ties resolve to the earlier label in [`Self::LABELS`].
    pub fn dominant(&self) -> &'static str {
        let mut best = 0;
        let values = self.values();
        for (i, v) in values.iter().enumerate() {
            if *v > values[best] {
                best = i;
            }
        }
        Self::LABELS[best]
    }

    /// Convert into a distribution value scored by the mood index.
    pub fn into_signal_value(self) -> SignalValue {
        let components = Self::LABELS
            .iter()
            .zip(self.values())
            .map(|(label, v)| (label.to_string(), v))
            .collect();
        SignalValue::Distribution {
            score: self.mood_index(),
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_type_round_trips_through_str() {
        for t in SignalType::ALL {
            assert_eq!(t.as_str().parse::<SignalType>().unwrap(), t);
        }
        assert_eq!("o3".parse::<SignalType>().unwrap(), SignalType::Ozone);
        assert_eq!("db_level".parse::<SignalType>().unwrap(), SignalType::NoiseLevel);
        assert!("plasma".parse::<SignalType>().is_err());
    }

    #[test]
    fn only_mood_is_index_family() {
        assert_eq!(SignalType::Mood.family(), SignalFamily::Index);
        assert_eq!(SignalType::Pm25.family(), SignalFamily::Physical);
        assert_eq!(SignalType::NoiseLevel.family(), SignalFamily::Physical);
    }

    #[test]
    fn clip_respects_domain() {
        assert_eq!(SignalType::Mood.clip(130.0), 100.0);
        assert_eq!(SignalType::Mood.clip(-4.0), 0.0);
        assert_eq!(SignalType::Pm25.clip(-1.0), 0.0);
        assert_eq!(SignalType::Pm25.clip(900.0), 900.0);
    }

    #[test]
    fn mood_index_from_emotions() {
        let happy = EmotionScores { joy: 0.9, neutral: 0.1, ..Default::default() };
        assert_eq!(happy.mood_index(), 100.0);

        let angry = EmotionScores { anger: 0.8, fear: 0.2, ..Default::default() };
        assert_eq!(angry.mood_index(), 0.0);

        let mixed = EmotionScores { joy: 0.3, sadness: 0.2, neutral: 0.5, ..Default::default() };
        // (0.8 - 0.2 + 1) * 50 = 80
        assert!((mixed.mood_index() - 80.0).abs() < 1e-9);
        assert_eq!(mixed.dominant(), "neutral");
    }

    #[test]
    fn emotion_dominant_tie_prefers_earlier_label() {
        let tied = EmotionScores { joy: 0.5, sadness: 0.5, ..Default::default() };
        assert_eq!(tied.dominant(), "joy");
    }

    #[test]
    fn distribution_dominant_and_score() {
        let value = EmotionScores { anger: 0.6, joy: 0.4, ..Default::default() }.into_signal_value();
        assert_eq!(value.dominant(), Some("anger"));
        assert!((value.score() - 40.0).abs() < 1e-9);
        assert_eq!(SignalValue::Scalar(3.0).dominant(), None);
    }

    #[test]
    fn non_finite_values_detected() {
        assert!(!SignalValue::Scalar(f64::NAN).is_finite());
        assert!(SignalValue::Scalar(1.0).is_finite());
    }
}
