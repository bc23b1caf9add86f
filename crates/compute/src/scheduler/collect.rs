//! Adapter from record producers to scheduler jobs.
//!
//! A [`Collector`] produces the records for one cycle; [`CollectionJob`]
//! commits them to the raw-record store as a single atomic batch, so a
//! failed cycle leaves no partial writes behind.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use pulse_core::{RawRecordStore, RawSignalRecord};

use super::task::{CollectionError, JobHandler};

/// Produces raw records for one collection cycle.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn collect(&self) -> Result<Vec<RawSignalRecord>, CollectionError>;

    /// Called after the cycle's batch has been committed.
    async fn on_committed(&self, _count: usize) {}
}

/// Runs a [`Collector`] and appends its output to the store.
pub struct CollectionJob {
    collector: Arc<dyn Collector>,
    store: Arc<dyn RawRecordStore>,
}

impl CollectionJob {
    pub fn new(collector: Arc<dyn Collector>, store: Arc<dyn RawRecordStore>) -> Self {
        Self { collector, store }
    }

    pub fn into_handler(self) -> Arc<dyn JobHandler> {
        Arc::new(self)
    }
}

#[async_trait]
impl JobHandler for CollectionJob {
    async fn run(&self) -> Result<(), CollectionError> {
        let records = self.collector.collect().await?;
        if records.is_empty() {
            debug!(collector = self.collector.name(), "No new records");
            return Ok(());
        }

        let store = Arc::clone(&self.store);
        let count = tokio::task::spawn_blocking(move || store.append_batch(records))
            .await
            .map_err(|e| CollectionError::Panicked(e.to_string()))??;

        self.collector.on_committed(count).await;
        info!(collector = self.collector.name(), count, "Committed collection batch");
        Ok(())
    }
}
