// src/pipeline/stages/matcher_stage.rs - Matches eligible payees against a Matcher capability
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use indicatif::MultiProgress;
use log::warn;
use std::sync::Arc;

use crate::matching::Matcher;
use crate::models::{PayeeClass, PayeeRecord, RecordUpdate, StageDescriptor, StageEnrichment};
use crate::pipeline::runner::{ChunkedRunner, OperationOutcome, ProgressReporter};
use crate::pipeline::stage::{mark_completed, mark_skipped, mark_step, Stage, StageOutcome};
use crate::store::SharedStore;
use crate::utils::pipeline_config::StageOptions;
use crate::utils::progress_bars::logging::StageLogger;
use crate::utils::progress_bars::progress_config::stage_progress_bar;

pub struct MatcherStage {
    descriptor: StageDescriptor,
    store: SharedStore,
    matcher: Arc<dyn Matcher>,
    multi_progress: Option<MultiProgress>,
}

impl MatcherStage {
    pub fn new(descriptor: StageDescriptor, store: SharedStore, matcher: Arc<dyn Matcher>) -> Self {
        Self {
            descriptor,
            store,
            matcher,
            multi_progress: None,
        }
    }

    pub fn with_progress(mut self, multi_progress: Option<MultiProgress>) -> Self {
        self.multi_progress = multi_progress;
        self
    }

    /// Individuals and blank names are never matched. Without `reprocess_existing`,
    /// records already enriched by this stage are left alone so a rerun resumes.
    pub fn is_eligible(&self, record: &PayeeRecord, options: &StageOptions) -> bool {
        if record.payee_class() == Some(PayeeClass::Individual) {
            return false;
        }
        if record.matchable_name().is_empty() {
            return false;
        }
        options.reprocess_existing || !record.has_enrichment(&self.descriptor.key)
    }
}

async fn match_record(
    record: PayeeRecord,
    matcher: Arc<dyn Matcher>,
    store: SharedStore,
    stage_key: String,
) -> Result<OperationOutcome> {
    let name = record.matchable_name();
    let result = match matcher.match_name(&name, &record.location).await {
        Ok(result) => result,
        Err(e) => {
            // Matcher failures count as non-matches.
            warn!(
                "{} matcher failed for record {}, counting as no match (transient: {}): {}",
                matcher.name(),
                record.id,
                e.is_transient(),
                e
            );
            return Ok(OperationOutcome::Unmatched);
        }
    };
    if !result.matched {
        return Ok(OperationOutcome::Unmatched);
    }

    let update = RecordUpdate::Enrichment {
        stage: stage_key,
        enrichment: StageEnrichment::from_match(&result, Utc::now()),
    };
    store
        .update_record(&record.id, update)
        .await
        .with_context(|| format!("Failed to store match for record {}", record.id))?;
    Ok(OperationOutcome::Succeeded)
}

#[async_trait]
impl Stage for MatcherStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    fn store(&self) -> &SharedStore {
        &self.store
    }

    async fn process(&self, batch_id: &str, options: &StageOptions) -> Result<StageOutcome> {
        let key = self.descriptor.key.clone();
        let logger = StageLogger::new(&key, batch_id);

        mark_step(
            &self.store,
            batch_id,
            &key,
            &format!("Matching payees against {}", self.matcher.name()),
        )
        .await?;

        let records = self
            .store
            .get_batch_records(batch_id)
            .await
            .with_context(|| format!("Failed to load records of batch {}", batch_id))?;
        let total = records.len();
        let eligible: Vec<PayeeRecord> = records
            .into_iter()
            .filter(|r| self.is_eligible(r, options))
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
        let reporter = ProgressReporter::new(self.store.clone(), batch_id, &key, "Matched");
        let runner = ChunkedRunner::new(options, logger.clone()).with_progress_bar(progress_bar);

        let summary = runner
            .run(eligible, &reporter, |record: PayeeRecord| {
                match_record(record, self.matcher.clone(), self.store.clone(), key.clone())
            })
            .await;

        let message = summary.summary_message("Matched");
        logger.log_completion(&message, summary.failed_records, summary.faulted_chunks().len());
        mark_completed(&self.store, batch_id, &key, &message).await?;
        Ok(StageOutcome::Completed { summary, message })
    }
}
