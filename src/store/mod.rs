// src/store/mod.rs - Record Store seam between the pipeline and durable storage
pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::models::{Batch, BatchUpdate, PayeeRecord, RecordUpdate};

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

/// Durable storage for batches and their records.
///
/// Every write targets exactly one batch or one record, so writes for distinct ids never contend.
/// Writes must stay valid after the watchdog has flagged a batch; last writer wins.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>>;

    /// Records of the batch in upload order.
    async fn get_batch_records(&self, batch_id: &str) -> Result<Vec<PayeeRecord>>;

    async fn update_record(&self, record_id: &str, update: RecordUpdate) -> Result<()>;

    /// Applies the set fields and refreshes the batch's last-activity timestamp.
    async fn update_batch(&self, batch_id: &str, update: BatchUpdate) -> Result<()>;

    /// Batches currently processing; what the watchdog inspects.
    async fn list_active_batches(&self) -> Result<Vec<Batch>>;

    /// Submitted batches that no worker has picked up yet.
    async fn list_pending_batches(&self) -> Result<Vec<Batch>>;
}

pub type SharedStore = Arc<dyn RecordStore>;
