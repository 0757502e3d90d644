// src/store/memory.rs - In-process Record Store used by tests and dry runs
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::models::{Batch, BatchStatus, BatchUpdate, PayeeRecord, RecordUpdate};
use crate::store::RecordStore;

#[derive(Default)]
struct MemoryState {
    batches: HashMap<String, Batch>,
    records: HashMap<String, Vec<PayeeRecord>>,
    /// record id -> (batch id, position)
    record_index: HashMap<String, (String, usize)>,
    batch_updates: HashMap<String, Vec<BatchUpdate>>,
    record_writes: HashMap<String, usize>,
}

/// Keeps everything behind one `RwLock`. The `fail_next_*` counters inject store outages.
#[derive(Default)]
pub struct MemoryRecordStore {
    state: RwLock<MemoryState>,
    fail_batch_updates: AtomicUsize,
    fail_listings: AtomicUsize,
    fail_record_reads: AtomicUsize,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a pending batch with `records`, re-pointing each record at the batch.
    pub async fn insert_batch(&self, batch_id: &str, records: Vec<PayeeRecord>) {
        let mut state = self.state.write().await;
        let batch = Batch::new(batch_id, records.len(), Utc::now());
        let records: Vec<PayeeRecord> = records
            .into_iter()
            .map(|mut r| {
                r.batch_id = batch_id.to_string();
                r
            })
            .collect();
        for (position, record) in records.iter().enumerate() {
            state
                .record_index
                .insert(record.id.clone(), (batch_id.to_string(), position));
        }
        state.batches.insert(batch_id.to_string(), batch);
        state.records.insert(batch_id.to_string(), records);
    }

    pub async fn set_last_activity(&self, batch_id: &str, at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        if let Some(batch) = state.batches.get_mut(batch_id) {
            batch.last_activity_at = at;
        }
    }

    /// Every update applied to the batch, in order.
    pub async fn batch_history(&self, batch_id: &str) -> Vec<BatchUpdate> {
        let state = self.state.read().await;
        state.batch_updates.get(batch_id).cloned().unwrap_or_default()
    }

    pub async fn record_write_count(&self, record_id: &str) -> usize {
        let state = self.state.read().await;
        state.record_writes.get(record_id).copied().unwrap_or(0)
    }

    pub async fn record(&self, record_id: &str) -> Option<PayeeRecord> {
        let state = self.state.read().await;
        let (batch_id, position) = state.record_index.get(record_id)?;
        state.records.get(batch_id)?.get(*position).cloned()
    }

    pub fn fail_next_batch_updates(&self, count: usize) {
        self.fail_batch_updates.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_listings(&self, count: usize) {
        self.fail_listings.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_record_reads(&self, count: usize) {
        self.fail_record_reads.store(count, Ordering::SeqCst);
    }

    async fn batches_with_status(&self, status: BatchStatus) -> Result<Vec<Batch>> {
        if take_failure(&self.fail_listings) {
            return Err(anyhow!("injected failure listing batches"));
        }
        let state = self.state.read().await;
        let mut batches: Vec<Batch> = state
            .batches
            .values()
            .filter(|b| b.status == status)
            .cloned()
            .collect();
        batches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(batches)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
        let state = self.state.read().await;
        Ok(state.batches.get(batch_id).cloned())
    }

    async fn get_batch_records(&self, batch_id: &str) -> Result<Vec<PayeeRecord>> {
        if take_failure(&self.fail_record_reads) {
            return Err(anyhow!("injected failure reading records of batch {}", batch_id));
        }
        let state = self.state.read().await;
        if !state.batches.contains_key(batch_id) {
            return Err(anyhow!("batch {} not found", batch_id));
        }
        Ok(state.records.get(batch_id).cloned().unwrap_or_default())
    }

    async fn update_record(&self, record_id: &str, update: RecordUpdate) -> Result<()> {
        let mut state = self.state.write().await;
        let (batch_id, position) = state
            .record_index
            .get(record_id)
            .cloned()
            .ok_or_else(|| anyhow!("record {} not found", record_id))?;
        let record = state
            .records
            .get_mut(&batch_id)
            .and_then(|records| records.get_mut(position))
            .ok_or_else(|| anyhow!("record {} missing from batch {}", record_id, batch_id))?;
        update.apply_to(record);
        *state.record_writes.entry(record_id.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn update_batch(&self, batch_id: &str, update: BatchUpdate) -> Result<()> {
        if take_failure(&self.fail_batch_updates) {
            return Err(anyhow!("injected failure updating batch {}", batch_id));
        }
        let mut state = self.state.write().await;
        let batch = state
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| anyhow!("batch {} not found", batch_id))?;
        update.apply_to(batch, Utc::now());
        state
            .batch_updates
            .entry(batch_id.to_string())
            .or_default()
            .push(update);
        Ok(())
    }

    async fn list_active_batches(&self) -> Result<Vec<Batch>> {
        self.batches_with_status(BatchStatus::Processing).await
    }

    async fn list_pending_batches(&self) -> Result<Vec<Batch>> {
        self.batches_with_status(BatchStatus::Pending).await
    }
}
