// src/pipeline/runner.rs - Chunked, bounded-concurrency execution of per-record operations
use anyhow::{Context, Result};
use futures::future::join_all;
use indicatif::ProgressBar;
use std::future::Future;

use crate::models::{BatchUpdate, PayeeRecord};
use crate::pipeline::fault::FaultKind;
use crate::store::SharedStore;
use crate::utils::get_memory_usage;
use crate::utils::pipeline_config::StageOptions;
use crate::utils::progress_bars::logging::StageLogger;

/// Anything the runner can attribute a failure to.
pub trait Identified {
    fn item_id(&self) -> &str;
}

impl Identified for PayeeRecord {
    fn item_id(&self) -> &str {
        &self.id
    }
}

/// What a successful operation reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Succeeded,
    /// Ran cleanly but produced nothing, e.g. no match.
    Unmatched,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Succeeded,
    Unmatched,
    Failed { record_id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFault {
    pub chunk_index: usize,
    pub size: usize,
    pub reason: String,
}

impl ChunkFault {
    pub fn kind(&self) -> FaultKind {
        FaultKind::Chunk
    }
}

/// Aggregate of one chunk. Not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkReport {
    pub chunk_index: usize,
    pub size: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub fault: Option<ChunkFault>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunSummary {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed_records: usize,
    pub chunks: Vec<ChunkReport>,
    /// Last percentage written to the store.
    pub last_progress: u8,
}

impl RunSummary {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn faulted_chunks(&self) -> Vec<&ChunkFault> {
        self.chunks.iter().filter_map(|c| c.fault.as_ref()).collect()
    }

    pub fn unprocessed(&self) -> usize {
        self.total.saturating_sub(self.processed)
    }

    /// "Matched 40/120", with an undercount note when chunks faulted.
    pub fn summary_message(&self, verb: &str) -> String {
        let mut message = format!("{} {}/{}", verb, self.succeeded, self.total);
        let faulted = self.faulted_chunks().len();
        if faulted > 0 {
            message.push_str(&format!(
                " ({} records not counted: {} chunk{} faulted)",
                self.unprocessed(),
                faulted,
                if faulted == 1 { "" } else { "s" }
            ));
        }
        message
    }
}

/// round(processed / total * 100), 0 for an empty total.
pub fn progress_percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (processed as f64 / total as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

/// Writes a stage's incremental progress to its batch.
pub struct ProgressReporter {
    store: SharedStore,
    batch_id: String,
    stage_key: String,
    verb: String,
}

impl ProgressReporter {
    pub fn new(store: SharedStore, batch_id: &str, stage_key: &str, verb: &str) -> Self {
        Self {
            store,
            batch_id: batch_id.to_string(),
            stage_key: stage_key.to_string(),
            verb: verb.to_string(),
        }
    }

    pub fn progress_message(&self, succeeded: usize, processed: usize, total: usize, percent: u8) -> String {
        format!(
            "{} {}/{} ({}%), {} of {} records processed",
            self.verb, succeeded, processed, percent, processed, total
        )
    }

    pub async fn report(&self, succeeded: usize, processed: usize, total: usize) -> Result<u8> {
        let percent = progress_percent(processed, total);
        let update = BatchUpdate::new()
            .stage_progress(&self.stage_key, percent)
            .message(self.progress_message(succeeded, processed, total, percent));
        self.store
            .update_batch(&self.batch_id, update)
            .await
            .with_context(|| format!("Failed to persist {} progress", self.stage_key))?;
        Ok(percent)
    }
}

/// Ordered chunks of at most `size` items; the last may be shorter.
pub fn partition<T>(items: &[T], size: usize) -> std::slice::Chunks<'_, T> {
    items.chunks(size.max(1))
}

/// Runs chunks strictly in order. Inside a chunk, sub-batches of at most `concurrency_limit`
/// operations are spawned together and joined before the next sub-batch starts.
pub struct ChunkedRunner {
    options: StageOptions,
    logger: StageLogger,
    progress_bar: Option<ProgressBar>,
}

impl ChunkedRunner {
    pub fn new(options: &StageOptions, logger: StageLogger) -> Self {
        Self {
            options: options.clone(),
            logger,
            progress_bar: None,
        }
    }

    pub fn with_progress_bar(mut self, progress_bar: Option<ProgressBar>) -> Self {
        self.progress_bar = progress_bar;
        self
    }

    pub async fn run<T, F, Fut>(&self, items: Vec<T>, reporter: &ProgressReporter, operation: F) -> RunSummary
    where
        T: Identified + Clone + Send + 'static,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<OperationOutcome>> + Send + 'static,
    {
        let total = items.len();
        let mut summary = RunSummary {
            total,
            ..RunSummary::default()
        };
        if total == 0 {
            return summary;
        }

        let chunk_size = self.options.chunk_size.max(1);
        let concurrency_limit = self.options.concurrency_limit.clamp(1, chunk_size);
        let total_chunks = (total + chunk_size - 1) / chunk_size;
        self.logger.log_chunk_plan(total, chunk_size, concurrency_limit);

        for (chunk_idx, chunk) in partition(&items, chunk_size).enumerate() {
            let chunk_num = chunk_idx + 1;
            let report = match self
                .run_chunk(chunk_idx, chunk, concurrency_limit, &operation, &summary, reporter)
                .await
            {
                Ok((report, percent)) => {
                    summary.processed += report.processed;
                    summary.succeeded += report.succeeded;
                    summary.failed_records += report.failed;
                    summary.last_progress = percent;
                    self.logger.log_chunk_progress(
                        chunk_num,
                        total_chunks,
                        summary.processed,
                        total,
                        summary.succeeded,
                        percent,
                    );
                    report
                }
                Err(e) => {
                    self.logger
                        .log_chunk_fault(chunk_num, total_chunks, chunk.len(), &format!("{:#}", e));
                    ChunkReport {
                        chunk_index: chunk_idx,
                        size: chunk.len(),
                        processed: 0,
                        succeeded: 0,
                        failed: 0,
                        fault: Some(ChunkFault {
                            chunk_index: chunk_idx,
                            size: chunk.len(),
                            reason: e.to_string(),
                        }),
                    }
                }
            };
            summary.chunks.push(report);

            if let Some(pb) = &self.progress_bar {
                pb.inc(chunk.len() as u64);
                pb.set_message(format!("{}/{} processed", summary.processed, total));
            }
            if chunk_num % 5 == 0 {
                self.logger.log_resources(get_memory_usage().await);
            }

            if chunk_num < total_chunks && self.options.inter_chunk_delay_ms > 0 {
                tokio::time::sleep(self.options.inter_chunk_delay()).await;
            }
        }

        if let Some(pb) = &self.progress_bar {
            pb.finish_with_message(format!("{}/{} processed", summary.processed, total));
        }
        summary
    }

    async fn run_chunk<T, F, Fut>(
        &self,
        chunk_idx: usize,
        chunk: &[T],
        concurrency_limit: usize,
        operation: &F,
        so_far: &RunSummary,
        reporter: &ProgressReporter,
    ) -> Result<(ChunkReport, u8)>
    where
        T: Identified + Clone + Send + 'static,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<OperationOutcome>> + Send + 'static,
    {
        let mut succeeded = 0;
        let mut failed = 0;

        for sub_batch in chunk.chunks(concurrency_limit) {
            let mut tasks = Vec::with_capacity(sub_batch.len());
            for item in sub_batch {
                let item_id = item.item_id().to_string();
                tasks.push((item_id, tokio::spawn(operation(item.clone()))));
            }
            let (ids, handles): (Vec<String>, Vec<_>) = tasks.into_iter().unzip();
            let results = join_all(handles).await;

            for (record_id, result) in ids.into_iter().zip(results) {
                let outcome = match result {
                    Ok(Ok(OperationOutcome::Succeeded)) => RecordOutcome::Succeeded,
                    Ok(Ok(OperationOutcome::Unmatched)) => RecordOutcome::Unmatched,
                    Ok(Err(e)) => RecordOutcome::Failed {
                        reason: format!("{:#}", e),
                        record_id,
                    },
                    Err(join_err) => RecordOutcome::Failed {
                        reason: format!("operation panicked or was cancelled: {}", join_err),
                        record_id,
                    },
                };
                match outcome {
                    RecordOutcome::Succeeded => succeeded += 1,
                    RecordOutcome::Unmatched => {}
                    RecordOutcome::Failed { record_id, reason } => {
                        self.logger.log_record_failure(&record_id, &reason);
                        failed += 1;
                    }
                }
            }
        }

        let processed = so_far.processed + chunk.len();
        let percent = reporter
            .report(so_far.succeeded + succeeded, processed, so_far.total)
            .await?;

        Ok((
            ChunkReport {
                chunk_index: chunk_idx,
                size: chunk.len(),
                processed: chunk.len(),
                succeeded,
                failed,
                fault: None,
            },
            percent,
        ))
    }
}
