// src/pipeline/stage.rs - Stage contract and the batch-status transitions stages share
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::warn;

use crate::models::{BatchStatus, BatchUpdate, StageDescriptor, StageStatus};
use crate::pipeline::fault::StageFault;
use crate::pipeline::runner::RunSummary;
use crate::store::SharedStore;
use crate::utils::pipeline_config::StageOptions;

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed { summary: RunSummary, message: String },
    /// Nothing eligible; not an error.
    Skipped { reason: String },
}

impl StageOutcome {
    pub fn status(&self) -> StageStatus {
        match self {
            StageOutcome::Completed { .. } => StageStatus::Completed,
            StageOutcome::Skipped { .. } => StageStatus::Skipped,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StageOutcome::Completed { message, .. } => message,
            StageOutcome::Skipped { reason } => reason,
        }
    }
}

/// One ordered unit of enrichment work over a batch.
///
/// Implementors provide `process`; `execute` is what the orchestrator calls. It converts any error
/// escaping `process` into a [`StageFault`] after marking the stage as errored on the batch.
#[async_trait]
pub trait Stage: Send + Sync {
    fn descriptor(&self) -> &StageDescriptor;

    fn store(&self) -> &SharedStore;

    async fn process(&self, batch_id: &str, options: &StageOptions) -> Result<StageOutcome>;

    async fn execute(&self, batch_id: &str, options: &StageOptions) -> Result<StageOutcome, StageFault> {
        let key = &self.descriptor().key;
        match self.process(batch_id, options).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let fault = StageFault::from_error(key, &e);
                if let Err(mark_err) = mark_error(self.store(), batch_id, key, &fault.message).await {
                    warn!(
                        "Could not record error status of stage {} on batch {}: {:#}",
                        key, batch_id, mark_err
                    );
                }
                Err(fault)
            }
        }
    }
}

/// Batch enters the stage: status processing, progress reset for this run.
pub async fn mark_started(store: &SharedStore, batch_id: &str, descriptor: &StageDescriptor) -> Result<()> {
    store
        .update_batch(
            batch_id,
            BatchUpdate::new()
                .status(BatchStatus::Processing)
                .current_stage(&descriptor.key)
                .current_step(format!("Starting {}", descriptor.label))
                .stage_status(&descriptor.key, StageStatus::Processing)
                .stage_progress(&descriptor.key, 0),
        )
        .await
        .with_context(|| format!("Failed to mark stage {} as processing", descriptor.key))
}

pub async fn mark_step(store: &SharedStore, batch_id: &str, stage_key: &str, step: &str) -> Result<()> {
    store
        .update_batch(
            batch_id,
            BatchUpdate::new()
                .current_step(step)
                .stage_status(stage_key, StageStatus::Processing),
        )
        .await
        .with_context(|| format!("Failed to record step of stage {}", stage_key))
}

pub async fn mark_skipped(store: &SharedStore, batch_id: &str, stage_key: &str, reason: &str) -> Result<()> {
    store
        .update_batch(
            batch_id,
            BatchUpdate::new()
                .message(reason)
                .stage_status(stage_key, StageStatus::Skipped)
                .stage_completed_at(stage_key, Utc::now()),
        )
        .await
        .with_context(|| format!("Failed to mark stage {} as skipped", stage_key))
}

pub async fn mark_completed(store: &SharedStore, batch_id: &str, stage_key: &str, message: &str) -> Result<()> {
    store
        .update_batch(
            batch_id,
            BatchUpdate::new()
                .message(message)
                .stage_status(stage_key, StageStatus::Completed)
                .stage_completed_at(stage_key, Utc::now()),
        )
        .await
        .with_context(|| format!("Failed to mark stage {} as completed", stage_key))
}

pub async fn mark_error(store: &SharedStore, batch_id: &str, stage_key: &str, message: &str) -> Result<()> {
    store
        .update_batch(
            batch_id,
            BatchUpdate::new()
                .message(format!("Error: {}", message))
                .stage_status(stage_key, StageStatus::Error),
        )
        .await
        .with_context(|| format!("Failed to mark stage {} as errored", stage_key))
}
