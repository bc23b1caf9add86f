use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signal::{EmotionScores, SignalType, SignalValue};

/// Identifier of a geographic entity (zone, district, sensor site).
pub type EntityId = String;

/// One timestamped observation for an entity. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSignalRecord {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub entity_id: EntityId,
    pub signal: SignalType,
    pub value: SignalValue,
    pub timestamp: DateTime<Utc>,
    /// Origin tag, e.g. "twitter" or "sensor_network".
    pub source: String,
}

impl RawSignalRecord {
    pub fn new(
        entity_id: impl Into<EntityId>,
        signal: SignalType,
        value: SignalValue,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.into(),
            signal,
            value,
            timestamp,
            source: source.into(),
        }
    }

    pub fn scalar(
        entity_id: impl Into<EntityId>,
        signal: SignalType,
        value: f64,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Self {
        Self::new(entity_id, signal, SignalValue::Scalar(value), timestamp, source)
    }

    /// Mood record carrying the full emotion distribution.
    pub fn mood(
        entity_id: impl Into<EntityId>,
        emotions: EmotionScores,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Self {
        Self::new(
            entity_id,
            SignalType::Mood,
            emotions.into_signal_value(),
            timestamp,
            source,
        )
    }

    pub fn score(&self) -> f64 {
        self.value.score()
    }
}
