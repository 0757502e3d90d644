// src/pipeline/stages/classification.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use indicatif::MultiProgress;

use crate::matching::classifier::PayeeClassifier;
use crate::models::{PayeeClass, PayeeRecord, RecordUpdate, StageDescriptor};
use crate::pipeline::runner::{ChunkedRunner, OperationOutcome, ProgressReporter};
use crate::pipeline::stage::{mark_completed, mark_skipped, mark_step, Stage, StageOutcome};
use crate::store::SharedStore;
use crate::utils::pipeline_config::StageOptions;
use crate::utils::progress_bars::logging::StageLogger;
use crate::utils::progress_bars::progress_config::stage_progress_bar;

/// Classifies payees as business, government or individual.
/// Records that end up `Unknown` are written but not counted as classified.
pub struct ClassificationStage {
    descriptor: StageDescriptor,
    store: SharedStore,
    classifier: PayeeClassifier,
    multi_progress: Option<MultiProgress>,
}

impl ClassificationStage {
    pub fn new(descriptor: StageDescriptor, store: SharedStore) -> Self {
        Self {
            descriptor,
            store,
            classifier: PayeeClassifier::new(),
            multi_progress: None,
        }
    }

    pub fn with_progress(mut self, multi_progress: Option<MultiProgress>) -> Self {
        self.multi_progress = multi_progress;
        self
    }

    fn is_eligible(record: &PayeeRecord, options: &StageOptions) -> bool {
        !record.raw_name.trim().is_empty()
            && (options.reprocess_existing || record.classification.is_none())
    }
}

#[async_trait]
impl Stage for ClassificationStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    fn store(&self) -> &SharedStore {
        &self.store
    }

    async fn process(&self, batch_id: &str, options: &StageOptions) -> Result<StageOutcome> {
        let key = self.descriptor.key.clone();
        let logger = StageLogger::new(&key, batch_id);
        mark_step(&self.store, batch_id, &key, "Classifying payees").await?;

        let records = self
            .store
            .get_batch_records(batch_id)
            .await
            .with_context(|| format!("Failed to load records of batch {}", batch_id))?;
        let total = records.len();
        let eligible: Vec<PayeeRecord> = records
            .into_iter()
            .filter(|r| Self::is_eligible(r, options))
            .collect();

        if eligible.is_empty() {
            let reason = format!("{}: no eligible records", self.descriptor.label);
            logger.log_skipped(&reason);
            mark_skipped(&self.store, batch_id, &key, &reason).await?;
            return Ok(StageOutcome::Skipped { reason });
        }

        logger.log_start(eligible.len(), total, options);
        let progress_bar = self
            .multi_progress
            .as_ref()
            .map(|mp| stage_progress_bar(mp, &self.descriptor.label, eligible.len()));
        let reporter = ProgressReporter::new(self.store.clone(), batch_id, &key, "Classified");
        let runner = ChunkedRunner::new(options, logger.clone()).with_progress_bar(progress_bar);

        let summary = runner
            .run(eligible, &reporter, |record: PayeeRecord| {
                let store = self.store.clone();
                let classification = self.classifier.classify(&record.raw_name);
                async move {
                    let class = classification.class;
                    store
                        .update_record(&record.id, RecordUpdate::Classification(classification))
                        .await
                        .with_context(|| format!("Failed to store classification for record {}", record.id))?;
                    Ok(if class == PayeeClass::Unknown {
                        OperationOutcome::Unmatched
                    } else {
                        OperationOutcome::Succeeded
                    })
                }
            })
            .await;

        let message = summary.summary_message("Classified");
        logger.log_completion(&message, summary.failed_records, summary.faulted_chunks().len());
        mark_completed(&self.store, batch_id, &key, &message).await?;
        Ok(StageOutcome::Completed { summary, message })
    }
}
