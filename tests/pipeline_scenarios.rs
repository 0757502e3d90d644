// tests/pipeline_scenarios.rs - End-to-end behaviour of the enrichment engine over the in-memory store
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use enrichment_lib::matching::{MatchResult, Matcher, MatcherError};
use enrichment_lib::models::{
    BatchStatus, BatchUpdate, LocationHints, PayeeRecord, StageDescriptor, StageStatus,
};
use enrichment_lib::pipeline::stages::{build_default_stages, MatcherStage, CLASSIFICATION, SUPPLIER_MATCH};
use enrichment_lib::pipeline::{
    wait_for_completion, PipelineOrchestrator, PipelineSupervisor, ScanOutcome, Stage, StageOutcome,
    StallWatchdog,
};
use enrichment_lib::store::{MemoryRecordStore, RecordStore, SharedStore};
use enrichment_lib::utils::pipeline_config::{PipelineConfig, StageOptions, WatchdogConfig};

/// Matches every normalized name starting with "a"; names containing "outage" make it fail.
struct ScriptedMatcher;

#[async_trait]
impl Matcher for ScriptedMatcher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn match_name(&self, name: &str, _hints: &LocationHints) -> Result<MatchResult, MatcherError> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        if name.contains("outage") {
            return Err(MatcherError::Timeout(Duration::from_millis(1)));
        }
        if name.starts_with('a') {
            Ok(MatchResult::matched(format!("ref-{}", name), 0.95, "exact", "scripted match"))
        } else {
            Ok(MatchResult::no_match("exact", "scripted miss"))
        }
    }
}

fn fast_options(chunk_size: usize, concurrency_limit: usize) -> StageOptions {
    StageOptions {
        chunk_size,
        concurrency_limit,
        inter_chunk_delay_ms: 1,
        reprocess_existing: false,
    }
}

/// 120 records, every third one named "Alpha ...".
fn mixed_records(batch_id: &str) -> Vec<PayeeRecord> {
    (0..120)
        .map(|i| {
            let name = if i % 3 == 0 {
                format!("Alpha Trading {}", i)
            } else {
                format!("Beta Trading {}", i)
            };
            PayeeRecord::new(format!("{}-r{}", batch_id, i), batch_id, name)
        })
        .collect()
}

fn supplier_stage(store: SharedStore) -> MatcherStage {
    MatcherStage::new(
        StageDescriptor::new(SUPPLIER_MATCH, "Supplier matching", 20),
        store,
        Arc::new(ScriptedMatcher),
    )
}

fn progress_writes(history: &[BatchUpdate], stage_key: &str) -> Vec<u8> {
    history
        .iter()
        .filter_map(|u| u.stage.as_ref())
        .filter(|s| s.key == stage_key)
        .filter_map(|s| s.progress)
        .collect()
}

#[tokio::test]
async fn matches_120_records_in_three_chunks() {
    let memory = Arc::new(MemoryRecordStore::new());
    memory.insert_batch("b-e2e", mixed_records("b-e2e")).await;
    let stage = supplier_stage(memory.clone());

    let outcome = stage.execute("b-e2e", &fast_options(50, 20)).await.unwrap();

    let StageOutcome::Completed { summary, message } = outcome else {
        panic!("stage should complete");
    };
    assert_eq!(message, "Matched 40/120");
    assert_eq!(
        summary.chunks.iter().map(|c| c.size).collect::<Vec<_>>(),
        vec![50, 50, 20]
    );
    assert_eq!(summary.processed, 120);
    assert_eq!(summary.last_progress, 100);

    // One write per chunk, each round(processed / total * 100).
    assert_eq!(progress_writes(&memory.batch_history("b-e2e").await, SUPPLIER_MATCH), vec![42, 83, 100]);

    let batch = memory.get_batch("b-e2e").await.unwrap().unwrap();
    let state = batch.stage(SUPPLIER_MATCH);
    assert_eq!(state.status, StageStatus::Completed);
    assert_eq!(state.progress, 100);
    assert_eq!(batch.progress_message.as_deref(), Some("Matched 40/120"));
}

#[tokio::test]
async fn progress_never_decreases_within_a_run() {
    let memory = Arc::new(MemoryRecordStore::new());
    let records: Vec<PayeeRecord> = (0..37)
        .map(|i| PayeeRecord::new(format!("r{}", i), "b-mono", format!("Acme {}", i)))
        .collect();
    memory.insert_batch("b-mono", records).await;

    supplier_stage(memory.clone())
        .execute("b-mono", &fast_options(5, 3))
        .await
        .unwrap();

    let writes = progress_writes(&memory.batch_history("b-mono").await, SUPPLIER_MATCH);
    assert_eq!(writes.len(), 8);
    assert!(writes.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {:?}", writes);
    assert_eq!(writes.last(), Some(&100));
}

#[tokio::test]
async fn one_failing_matcher_call_does_not_affect_the_chunk() {
    let memory = Arc::new(MemoryRecordStore::new());
    let mut records: Vec<PayeeRecord> = (0..9)
        .map(|i| PayeeRecord::new(format!("r{}", i), "b-iso", format!("Apex {}", i)))
        .collect();
    records.push(PayeeRecord::new("r-outage", "b-iso", "Apex outage"));
    memory.insert_batch("b-iso", records).await;

    let outcome = supplier_stage(memory.clone())
        .execute("b-iso", &fast_options(10, 10))
        .await
        .unwrap();

    assert_eq!(outcome.message(), "Matched 9/10");
    for i in 0..9 {
        let record = memory.record(&format!("r{}", i)).await.unwrap();
        assert!(record.has_enrichment(SUPPLIER_MATCH));
    }
    assert!(!memory.record("r-outage").await.unwrap().has_enrichment(SUPPLIER_MATCH));
}

#[tokio::test]
async fn rerunning_a_stage_overwrites_without_duplicating() {
    let memory = Arc::new(MemoryRecordStore::new());
    memory.insert_batch("b-idem", mixed_records("b-idem")).await;
    let stage = supplier_stage(memory.clone());

    stage.execute("b-idem", &fast_options(50, 20)).await.unwrap();
    let before = memory.record("b-idem-r0").await.unwrap();

    // Without reprocessing every matched record is left alone; the misses are retried.
    let resumed = stage.execute("b-idem", &fast_options(50, 20)).await.unwrap();
    assert_eq!(resumed.message(), "Matched 0/80");
    assert_eq!(memory.record_write_count("b-idem-r0").await, 1);

    let mut reprocess = fast_options(50, 20);
    reprocess.reprocess_existing = true;
    stage.execute("b-idem", &reprocess).await.unwrap();

    let after = memory.record("b-idem-r0").await.unwrap();
    assert_eq!(after.enrichments.len(), 1);
    assert_eq!(
        after.enrichments[SUPPLIER_MATCH].candidate_id,
        before.enrichments[SUPPLIER_MATCH].candidate_id
    );
    assert_eq!(memory.record_write_count("b-idem-r0").await, 2);
}

#[tokio::test]
async fn empty_batch_skips_every_stage_and_completes() {
    let memory = Arc::new(MemoryRecordStore::new());
    memory.insert_batch("b-empty", vec![]).await;
    let store: SharedStore = memory.clone();
    let config = PipelineConfig::default();
    let stages = build_default_stages(store.clone(), Arc::new(ScriptedMatcher), &config, None);
    let orchestrator = PipelineOrchestrator::new(store, stages, config);

    let outcome = orchestrator.run("b-empty").await.unwrap();

    assert_eq!(outcome.status, BatchStatus::Completed);
    assert_eq!(outcome.stage(CLASSIFICATION).unwrap().status, StageStatus::Skipped);
    assert_eq!(outcome.stage(SUPPLIER_MATCH).unwrap().status, StageStatus::Skipped);

    // Only the reset written when each stage starts.
    let history = memory.batch_history("b-empty").await;
    assert_eq!(progress_writes(&history, CLASSIFICATION), vec![0]);
    assert_eq!(progress_writes(&history, SUPPLIER_MATCH), vec![0]);
}

#[tokio::test]
async fn next_stage_starts_only_after_previous_is_terminal() {
    let memory = Arc::new(MemoryRecordStore::new());
    memory.insert_batch("b-order", mixed_records("b-order")).await;
    let store: SharedStore = memory.clone();
    let mut config = PipelineConfig::default();
    config.defaults = fast_options(50, 20);
    let stages = build_default_stages(store.clone(), Arc::new(ScriptedMatcher), &config, None);
    let orchestrator = PipelineOrchestrator::new(store, stages, config);

    let outcome = orchestrator.run("b-order").await.unwrap();
    assert_eq!(outcome.status, BatchStatus::Completed);

    let history = memory.batch_history("b-order").await;
    let position = |key: &str, status: StageStatus| {
        history.iter().position(|u| {
            u.stage
                .as_ref()
                .map(|s| s.key == key && s.status == Some(status))
                .unwrap_or(false)
        })
    };
    let classification_done = position(CLASSIFICATION, StageStatus::Completed).unwrap();
    let matching_started = position(SUPPLIER_MATCH, StageStatus::Processing).unwrap();
    assert!(classification_done < matching_started);

    let batch = memory.get_batch("b-order").await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.stage(CLASSIFICATION).status, StageStatus::Completed);
    assert_eq!(batch.stage(SUPPLIER_MATCH).status, StageStatus::Completed);
}

#[tokio::test]
async fn watchdog_flags_only_batches_past_the_threshold() {
    let memory = Arc::new(MemoryRecordStore::new());
    for (id, idle) in [("b-stale", 400), ("b-busy", 100)] {
        memory.insert_batch(id, vec![]).await;
        memory
            .update_batch(
                id,
                BatchUpdate::new()
                    .status(BatchStatus::Processing)
                    .current_stage(SUPPLIER_MATCH)
                    .stage_status(SUPPLIER_MATCH, StageStatus::Processing),
            )
            .await
            .unwrap();
        memory
            .set_last_activity(id, Utc::now() - chrono::Duration::seconds(idle))
            .await;
    }
    let watchdog = StallWatchdog::new(
        memory.clone(),
        WatchdogConfig {
            scan_interval: Duration::from_secs(60),
            stall_threshold: Duration::from_secs(300),
        },
    );

    // First cycle hits an unavailable store and changes nothing.
    memory.fail_next_listings(1);
    assert!(matches!(watchdog.scan().await, ScanOutcome::StoreUnavailable { .. }));
    assert_eq!(
        memory.get_batch("b-stale").await.unwrap().unwrap().status,
        BatchStatus::Processing
    );

    let ScanOutcome::Scanned { stalled, .. } = watchdog.scan().await else {
        panic!("second scan should reach the store");
    };
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].batch_id, "b-stale");

    let stale = memory.get_batch("b-stale").await.unwrap().unwrap();
    assert_eq!(stale.status, BatchStatus::Stalled);
    assert_eq!(stale.stage(SUPPLIER_MATCH).status, StageStatus::Error);
    assert!(stale
        .progress_message
        .unwrap()
        .starts_with("stalled: no activity for"));

    let busy = memory.get_batch("b-busy").await.unwrap().unwrap();
    assert_eq!(busy.status, BatchStatus::Processing);
}

#[tokio::test]
async fn supervisor_runs_submitted_batch_to_completion() {
    let memory = Arc::new(MemoryRecordStore::new());
    memory.insert_batch("b-sup", mixed_records("b-sup")).await;
    let store: SharedStore = memory.clone();
    let mut config = PipelineConfig::default();
    config.defaults = fast_options(50, 20);
    let stages: Vec<Arc<dyn Stage>> =
        build_default_stages(store.clone(), Arc::new(ScriptedMatcher), &config, None);
    let orchestrator = Arc::new(PipelineOrchestrator::new(store.clone(), stages, config.clone()));
    let watchdog = Arc::new(StallWatchdog::new(store.clone(), config.watchdog.clone()));

    let handle = PipelineSupervisor::new(orchestrator, watchdog).start();
    handle.submit("b-sup").await.unwrap();

    let batch = wait_for_completion(
        memory.as_ref(),
        "b-sup",
        Duration::from_millis(10),
        Duration::from_secs(10),
    )
    .await
    .unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(handle.stop().await.unwrap(), 1);
}
