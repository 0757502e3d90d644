// src/pipeline/orchestrator.rs - Runs the enabled stages of a batch in order
use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::error;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::models::{execution_order, BatchStatus, BatchUpdate, StageStatus};
use crate::pipeline::fault::{FaultKind, StageFault};
use crate::pipeline::stage::{mark_started, Stage, StageOutcome};
use crate::store::SharedStore;
use crate::utils::pipeline_config::{FailurePolicy, PipelineConfig};
use crate::utils::progress_bars::logging::{
    log_batch_completion, log_batch_start, log_stage_failed, log_stage_finished, log_stage_not_run,
    log_stage_starting,
};

#[derive(Debug, Clone)]
pub struct StageReport {
    pub key: String,
    pub status: StageStatus,
    pub message: String,
    pub outcome: Option<StageOutcome>,
    pub fault: Option<StageFault>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub run_id: String,
    pub status: BatchStatus,
    pub message: String,
    pub stages: Vec<StageReport>,
}

impl BatchOutcome {
    /// Most severe fault contained during the run: stage, then chunk, then record.
    pub fn fault_kind(&self) -> Option<FaultKind> {
        if let Some(fault) = self.stages.iter().find_map(|s| s.fault.as_ref()) {
            return Some(fault.kind());
        }
        let mut kind = None;
        for report in &self.stages {
            if let Some(StageOutcome::Completed { summary, .. }) = &report.outcome {
                if let Some(chunk) = summary.faulted_chunks().first() {
                    return Some(chunk.kind());
                }
                if summary.failed_records > 0 {
                    kind = Some(FaultKind::Record);
                }
            }
        }
        kind
    }

    pub fn stage(&self, key: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.key == key)
    }
}

pub struct PipelineOrchestrator {
    store: SharedStore,
    stages: Vec<Arc<dyn Stage>>,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    pub fn new(store: SharedStore, stages: Vec<Arc<dyn Stage>>, config: PipelineConfig) -> Self {
        Self {
            store,
            stages,
            config,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Enabled stages by ascending order; ties keep registration order.
    pub fn enabled_stages(&self) -> Vec<Arc<dyn Stage>> {
        let descriptors: Vec<_> = self.stages.iter().map(|s| s.descriptor()).collect();
        execution_order(&descriptors)
            .into_iter()
            .map(|i| self.stages[i].clone())
            .collect()
    }

    /// Persists the stage's final status before the next stage may start. Repeats what a
    /// well-behaved stage already wrote; a failed write is logged and the run goes on.
    async fn record_stage_result(
        &self,
        batch_id: &str,
        key: &str,
        result: &Result<StageOutcome, StageFault>,
    ) {
        let update = match result {
            Ok(outcome) => BatchUpdate::new()
                .stage_status(key, outcome.status())
                .stage_completed_at(key, Utc::now()),
            Err(fault) => BatchUpdate::new()
                .message(format!("Error: {}", fault.message))
                .stage_status(key, StageStatus::Error),
        };
        if let Err(e) = self.store.update_batch(batch_id, update).await {
            error!(
                "Could not record final status of stage {} on batch {}: {:#}",
                key, batch_id, e
            );
        }
    }

    /// Runs every enabled stage of the batch, one after another.
    ///
    /// Stage faults are folded into the returned outcome. `Err` means the batch could not be
    /// read at all.
    pub async fn run(&self, batch_id: &str) -> Result<BatchOutcome> {
        let batch = self
            .store
            .get_batch(batch_id)
            .await
            .with_context(|| format!("Failed to load batch {}", batch_id))?;
        if batch.is_none() {
            bail!("batch {} not found", batch_id);
        }

        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let stages = self.enabled_stages();
        let keys: Vec<String> = stages.iter().map(|s| s.descriptor().key.clone()).collect();
        log_batch_start(batch_id, &run_id, &keys, self.config.failure_policy);

        if let Err(e) = self
            .store
            .update_batch(
                batch_id,
                BatchUpdate::new()
                    .status(BatchStatus::Processing)
                    .current_step("Starting pipeline")
                    .message(format!("Pipeline started with {} stages", stages.len())),
            )
            .await
        {
            error!("Could not mark batch {} as processing: {:#}", batch_id, e);
        }

        let mut reports: Vec<StageReport> = Vec::with_capacity(stages.len());
        let mut first_failure: Option<StageFault> = None;

        for (position, stage) in stages.iter().enumerate() {
            let descriptor = stage.descriptor();
            let key = descriptor.key.clone();

            if let (Some(fault), FailurePolicy::StopOnFirstFailure) =
                (&first_failure, self.config.failure_policy)
            {
                log_stage_not_run(batch_id, &key, &fault.stage);
                let message = format!("Not run: stage '{}' failed", fault.stage);
                if let Err(e) = self
                    .store
                    .update_batch(batch_id, BatchUpdate::new().stage_status(&key, StageStatus::Skipped))
                    .await
                {
                    error!("Could not mark stage {} of batch {} as skipped: {:#}", key, batch_id, e);
                }
                reports.push(StageReport {
                    key,
                    status: StageStatus::Skipped,
                    message,
                    outcome: None,
                    fault: None,
                    duration: Duration::ZERO,
                });
                continue;
            }

            log_stage_starting(batch_id, &key, position + 1, stages.len());
            let stage_started = Instant::now();
            let options = self.config.options_for(&key);

            let result = match mark_started(&self.store, batch_id, descriptor).await {
                Ok(()) => stage.execute(batch_id, &options).await,
                Err(e) => Err(StageFault::from_error(&key, &e)),
            };
            let duration = stage_started.elapsed();
            self.record_stage_result(batch_id, &key, &result).await;

            match result {
                Ok(outcome) => {
                    log_stage_finished(batch_id, &key, outcome.status(), outcome.message(), duration);
                    reports.push(StageReport {
                        key,
                        status: outcome.status(),
                        message: outcome.message().to_string(),
                        outcome: Some(outcome),
                        fault: None,
                        duration,
                    });
                }
                Err(fault) => {
                    log_stage_failed(batch_id, &key, duration, &fault.detail);
                    reports.push(StageReport {
                        key,
                        status: StageStatus::Error,
                        message: format!("Error: {}", fault.message),
                        outcome: None,
                        fault: Some(fault.clone()),
                        duration,
                    });
                    if first_failure.is_none() {
                        first_failure = Some(fault);
                    }
                }
            }
        }

        let (status, message) = match &first_failure {
            Some(fault) => (BatchStatus::Failed, format!("Error: {}", fault.message)),
            None => {
                let summaries: Vec<&str> = reports.iter().map(|r| r.message.as_str()).collect();
                let message = if summaries.is_empty() {
                    "No stages enabled".to_string()
                } else {
                    summaries.join("; ")
                };
                (BatchStatus::Completed, message)
            }
        };

        if let Err(e) = self
            .store
            .update_batch(
                batch_id,
                BatchUpdate::new()
                    .status(status)
                    .current_step("Finished")
                    .message(message.clone()),
            )
            .await
        {
            error!("Could not record final status of batch {}: {:#}", batch_id, e);
        }
        log_batch_completion(batch_id, status, started.elapsed(), &message);

        Ok(BatchOutcome {
            batch_id: batch_id.to_string(),
            run_id,
            status,
            message,
            stages: reports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PayeeRecord, StageDescriptor};
    use crate::pipeline::runner::{ChunkFault, ChunkReport, RunSummary};
    use crate::store::{MemoryRecordStore, RecordStore};
    use crate::utils::pipeline_config::StageOptions;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    /// Records each call and fails when told to.
    struct ScriptedStage {
        descriptor: StageDescriptor,
        store: SharedStore,
        fail: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Stage for ScriptedStage {
        fn descriptor(&self) -> &StageDescriptor {
            &self.descriptor
        }

        fn store(&self) -> &SharedStore {
            &self.store
        }

        async fn process(&self, _batch_id: &str, _options: &StageOptions) -> Result<StageOutcome> {
            self.calls.lock().await.push(self.descriptor.key.clone());
            if self.fail {
                return Err(anyhow!("{} blew up", self.descriptor.key));
            }
            Ok(StageOutcome::Completed {
                summary: RunSummary::default(),
                message: format!("{} done", self.descriptor.key),
            })
        }
    }

    fn scripted(
        store: &Arc<MemoryRecordStore>,
        calls: &Arc<Mutex<Vec<String>>>,
        key: &str,
        order: i32,
        fail: bool,
    ) -> Arc<dyn Stage> {
        Arc::new(ScriptedStage {
            descriptor: StageDescriptor::new(key, key, order),
            store: store.clone(),
            fail,
            calls: calls.clone(),
        })
    }

    async fn seeded() -> Arc<MemoryRecordStore> {
        let store = Arc::new(MemoryRecordStore::new());
        store
            .insert_batch("b-1", vec![PayeeRecord::new("r-1", "b-1", "Acme")])
            .await;
        store
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let store = seeded().await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![
            scripted(&store, &calls, "lookup", 30, false),
            scripted(&store, &calls, "classify", 10, false),
            scripted(&store, &calls, "match", 20, false),
        ];
        let orchestrator = PipelineOrchestrator::new(store.clone(), stages, PipelineConfig::default());

        let outcome = orchestrator.run("b-1").await.unwrap();
        assert_eq!(*calls.lock().await, vec!["classify", "match", "lookup"]);
        assert_eq!(outcome.status, BatchStatus::Completed);
        assert_eq!(outcome.message, "classify done; match done; lookup done");
        assert!(outcome.fault_kind().is_none());

        let batch = store.get_batch("b-1").await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_first_failure_stops_remaining_stages() {
        let store = seeded().await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![
            scripted(&store, &calls, "classify", 10, false),
            scripted(&store, &calls, "match", 20, true),
            scripted(&store, &calls, "lookup", 30, false),
        ];
        let orchestrator = PipelineOrchestrator::new(store.clone(), stages, PipelineConfig::default());

        let outcome = orchestrator.run("b-1").await.unwrap();
        assert_eq!(*calls.lock().await, vec!["classify", "match"]);
        assert_eq!(outcome.status, BatchStatus::Failed);
        assert_eq!(outcome.message, "Error: match blew up");
        assert_eq!(outcome.fault_kind(), Some(FaultKind::Stage));
        assert_eq!(outcome.stage("lookup").unwrap().status, StageStatus::Skipped);

        let batch = store.get_batch("b-1").await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.stage("match").status, StageStatus::Error);
        assert_eq!(batch.stage("classify").status, StageStatus::Completed);
        assert_eq!(batch.progress_message.as_deref(), Some("Error: match blew up"));
    }

    /// Completes without touching the batch itself.
    struct SilentStage {
        descriptor: StageDescriptor,
        store: SharedStore,
    }

    #[async_trait]
    impl Stage for SilentStage {
        fn descriptor(&self) -> &StageDescriptor {
            &self.descriptor
        }

        fn store(&self) -> &SharedStore {
            &self.store
        }

        async fn process(&self, _batch_id: &str, _options: &StageOptions) -> Result<StageOutcome> {
            Ok(StageOutcome::Completed {
                summary: RunSummary::default(),
                message: "silent done".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_failed_stage_start_is_recorded_as_stage_error() {
        let store = seeded().await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![
            scripted(&store, &calls, "classification", 10, false),
            scripted(&store, &calls, "match", 20, false),
        ];
        let orchestrator = PipelineOrchestrator::new(store.clone(), stages, PipelineConfig::default());

        // Pipeline start and the stage-start write both fail.
        store.fail_next_batch_updates(2);
        let outcome = orchestrator.run("b-1").await.unwrap();

        assert!(calls.lock().await.is_empty());
        assert_eq!(outcome.status, BatchStatus::Failed);
        assert_eq!(outcome.stage("classification").unwrap().status, StageStatus::Error);

        let batch = store.get_batch("b-1").await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.stage("classification").status, StageStatus::Error);
        assert_eq!(batch.stage("match").status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn test_stage_is_terminal_before_next_stage_starts() {
        let store = seeded().await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let silent: Arc<dyn Stage> = Arc::new(SilentStage {
            descriptor: StageDescriptor::new("silent", "silent", 10),
            store: store.clone(),
        });
        let stages = vec![silent, scripted(&store, &calls, "match", 20, false)];
        let orchestrator = PipelineOrchestrator::new(store.clone(), stages, PipelineConfig::default());

        let outcome = orchestrator.run("b-1").await.unwrap();
        assert_eq!(outcome.status, BatchStatus::Completed);

        let history = store.batch_history("b-1").await;
        let silent_done = history
            .iter()
            .position(|u| {
                u.stage.as_ref().map_or(false, |s| {
                    s.key == "silent" && s.status == Some(StageStatus::Completed)
                })
            })
            .expect("silent stage should be recorded as completed");
        let match_started = history
            .iter()
            .position(|u| u.current_stage.as_deref() == Some("match"))
            .expect("match stage should start");
        assert!(silent_done < match_started);

        let batch = store.get_batch("b-1").await.unwrap().unwrap();
        assert_eq!(batch.stage("silent").status, StageStatus::Completed);
        assert!(batch.stage("silent").completed_at.is_some());
    }

    #[tokio::test]
    async fn test_continue_policy_runs_independent_stages() {
        let store = seeded().await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![
            scripted(&store, &calls, "classify", 10, true),
            scripted(&store, &calls, "match", 20, false),
        ];
        let config = PipelineConfig {
            failure_policy: FailurePolicy::ContinueIndependentStages,
            ..PipelineConfig::default()
        };
        let orchestrator = PipelineOrchestrator::new(store.clone(), stages, config);

        let outcome = orchestrator.run("b-1").await.unwrap();
        assert_eq!(*calls.lock().await, vec!["classify", "match"]);
        assert_eq!(outcome.status, BatchStatus::Failed);
        assert_eq!(outcome.stage("match").unwrap().status, StageStatus::Completed);
    }

    #[tokio::test]
    async fn test_disabled_stage_is_not_invoked() {
        let store = seeded().await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let disabled: Arc<dyn Stage> = Arc::new(ScriptedStage {
            descriptor: StageDescriptor::new("lookup", "lookup", 5).with_enabled(false),
            store: store.clone(),
            fail: false,
            calls: calls.clone(),
        });
        let stages = vec![scripted(&store, &calls, "classify", 10, false), disabled];
        let orchestrator = PipelineOrchestrator::new(store.clone(), stages, PipelineConfig::default());

        assert_eq!(orchestrator.enabled_stages().len(), 1);
        let outcome = orchestrator.run("b-1").await.unwrap();
        assert_eq!(*calls.lock().await, vec!["classify"]);
        assert_eq!(outcome.stages.len(), 1);
    }

    #[test]
    fn test_fault_kind_reports_most_severe_contained_fault() {
        let report = |summary: RunSummary| StageReport {
            key: "match".to_string(),
            status: StageStatus::Completed,
            message: String::new(),
            outcome: Some(StageOutcome::Completed {
                summary,
                message: String::new(),
            }),
            fault: None,
            duration: Duration::ZERO,
        };
        let outcome = |stages: Vec<StageReport>| BatchOutcome {
            batch_id: "b-1".to_string(),
            run_id: "run".to_string(),
            status: BatchStatus::Completed,
            message: String::new(),
            stages,
        };

        assert_eq!(outcome(vec![report(RunSummary::default())]).fault_kind(), None);

        let with_failed_record = RunSummary {
            failed_records: 2,
            ..RunSummary::default()
        };
        assert_eq!(
            outcome(vec![report(with_failed_record.clone())]).fault_kind(),
            Some(FaultKind::Record)
        );

        let mut with_faulted_chunk = with_failed_record;
        with_faulted_chunk.chunks.push(ChunkReport {
            chunk_index: 1,
            size: 10,
            processed: 0,
            succeeded: 0,
            failed: 0,
            fault: Some(ChunkFault {
                chunk_index: 1,
                size: 10,
                reason: "progress write failed".to_string(),
            }),
        });
        assert_eq!(
            outcome(vec![report(RunSummary::default()), report(with_faulted_chunk)]).fault_kind(),
            Some(FaultKind::Chunk)
        );
    }

    #[tokio::test]
    async fn test_unknown_batch_is_an_error() {
        let store = Arc::new(MemoryRecordStore::new());
        let orchestrator = PipelineOrchestrator::new(store, Vec::new(), PipelineConfig::default());
        assert!(orchestrator.run("missing").await.is_err());
    }
}
