//! Raw-record store contract and an in-memory implementation.
//!
//! The store is the only shared collaborator between collection jobs
//! (writers) and the analytics read path (readers). Implementations must
//! return fetched records ordered by timestamp.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::StoreError;
use crate::record::{EntityId, RawSignalRecord};
use crate::signal::SignalType;

/// Filter for [`RawRecordStore::fetch`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    pub entity: Option<EntityId>,
    pub signal: Option<SignalType>,
    /// Inclusive lower bound on record timestamps.
    pub since: DateTime<Utc>,
}

impl RecordQuery {
    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            entity: None,
            signal: None,
            since,
        }
    }

    pub fn entity(mut self, entity: impl Into<EntityId>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn signal(mut self, signal: SignalType) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn matches(&self, record: &RawSignalRecord) -> bool {
        record.timestamp >= self.since
            && self.entity.as_ref().map_or(true, |e| *e == record.entity_id)
            && self.signal.map_or(true, |s| s == record.signal)
    }
}

/// Append/fetch access to raw signal records.
pub trait RawRecordStore: Send + Sync {
    /// Append a single record.
    fn append(&self, record: RawSignalRecord) -> Result<(), StoreError>;

    /// Append a batch atomically: either every record is committed or none is.
    fn append_batch(&self, records: Vec<RawSignalRecord>) -> Result<usize, StoreError>;

    /// Records matching `query`, ordered by timestamp ascending.
    fn fetch(&self, query: &RecordQuery) -> Result<Vec<RawSignalRecord>, StoreError>;

    /// Distinct entity ids present in the store, sorted.
    fn entities(&self) -> Result<Vec<EntityId>, StoreError>;
}

/// Process-local store backed by a timestamp-ordered `Vec`.
#[derive(Debug)]
pub struct MemoryRecordStore {
    records: RwLock<Vec<RawSignalRecord>>,
    available: AtomicBool,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability; while unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Writes validate the whole batch before touching the vector, so the
    /// count stays meaningful even if a writer panicked.
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        }
    }

    fn validate(record: &RawSignalRecord) -> Result<(), StoreError> {
        if !record.value.is_finite() {
            return Err(StoreError::Rejected {
                id: record.id.to_string(),
                reason: "non-finite value".to_string(),
            });
        }
        if record.entity_id.is_empty() {
            return Err(StoreError::Rejected {
                id: record.id.to_string(),
                reason: "empty entity id".to_string(),
            });
        }
        Ok(())
    }

    /// Insert keeping timestamp order; equal timestamps keep arrival order.
    fn insert_ordered(records: &mut Vec<RawSignalRecord>, record: RawSignalRecord) {
        let pos = records.partition_point(|r| r.timestamp <= record.timestamp);
        records.insert(pos, record);
    }
}

impl RawRecordStore for MemoryRecordStore {
    fn append(&self, record: RawSignalRecord) -> Result<(), StoreError> {
        self.check_available()?;
        Self::validate(&record)?;
        let mut records = self
            .records
            .write()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        Self::insert_ordered(&mut records, record);
        Ok(())
    }

    fn append_batch(&self, batch: Vec<RawSignalRecord>) -> Result<usize, StoreError> {
        self.check_available()?;
        // Validate everything before touching shared state so a bad record
        // leaves the store unchanged.
        for record in &batch {
            Self::validate(record)?;
        }
        let count = batch.len();
        let mut records = self
            .records
            .write()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        for record in batch {
            Self::insert_ordered(&mut records, record);
        }
        debug!(count, total = records.len(), "batch committed");
        Ok(count)
    }

    fn fetch(&self, query: &RecordQuery) -> Result<Vec<RawSignalRecord>, StoreError> {
        self.check_available()?;
        let records = self
            .records
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        let start = records.partition_point(|r| r.timestamp < query.since);
        Ok(records[start..]
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }

    fn entities(&self) -> Result<Vec<EntityId>, StoreError> {
        self.check_available()?;
        let records = self
            .records
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        let set: BTreeSet<&EntityId> = records.iter().map(|r| &r.entity_id).collect();
        Ok(set.into_iter().cloned().collect())
    }
}
