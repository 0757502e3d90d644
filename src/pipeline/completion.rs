// src/pipeline/completion.rs
use anyhow::{anyhow, bail, Context, Result};
use std::time::Duration;

use crate::models::Batch;
use crate::store::RecordStore;

/// Polls the store until the batch reaches a terminal status.
///
/// A batch flagged by the watchdog counts as terminal, which is what releases waiters on a stall.
pub async fn wait_for_completion(
    store: &dyn RecordStore,
    batch_id: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<Batch> {
    tokio::time::timeout(timeout, poll_until_terminal(store, batch_id, poll_interval))
        .await
        .map_err(|_| anyhow!("timed out after {:?} waiting for batch {}", timeout, batch_id))?
}

async fn poll_until_terminal(store: &dyn RecordStore, batch_id: &str, poll_interval: Duration) -> Result<Batch> {
    loop {
        let batch = store
            .get_batch(batch_id)
            .await
            .with_context(|| format!("Failed to poll batch {}", batch_id))?;
        match batch {
            Some(batch) if batch.status.is_terminal() => return Ok(batch),
            Some(_) => tokio::time::sleep(poll_interval).await,
            None => bail!("batch {} not found", batch_id),
        }
    }
}
