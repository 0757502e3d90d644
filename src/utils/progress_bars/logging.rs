// src/utils/progress_bars/logging.rs - Logging helpers for stages, the orchestrator and the watchdog
use log::{debug, error, info, warn};
use std::time::{Duration, Instant};

use crate::models::{BatchStatus, StageStatus};
use crate::utils::pipeline_config::{FailurePolicy, StageOptions};

fn stage_tag(stage_key: &str) -> (String, &'static str) {
    let emoji = match stage_key {
        "classification" => "🏷️",
        "supplier_match" => "🔗",
        "external_lookup" => "🌐",
        _ => "⚙️",
    };
    (stage_key.to_uppercase(), emoji)
}

#[derive(Clone)]
pub struct StageLogger {
    stage_name: String,
    stage_emoji: &'static str,
    batch_id: String,
    start_time: Instant,
}

impl StageLogger {
    pub fn new(stage_key: &str, batch_id: &str) -> Self {
        let (stage_name, stage_emoji) = stage_tag(stage_key);
        Self {
            stage_name,
            stage_emoji,
            batch_id: batch_id.to_string(),
            start_time: Instant::now(),
        }
    }

    pub fn log_start(&self, eligible: usize, total: usize, options: &StageOptions) {
        info!(
            "[{}] {} 🚀 Starting batch {}: {} of {} records eligible",
            self.stage_name, self.stage_emoji, self.batch_id, eligible, total
        );
        info!(
            "[{}] {} ⚙️  chunk size {}, concurrency {}, inter-chunk delay {}ms, reprocess existing: {}",
            self.stage_name,
            self.stage_emoji,
            options.chunk_size,
            options.concurrency_limit,
            options.inter_chunk_delay_ms,
            options.reprocess_existing
        );
    }

    pub fn log_skipped(&self, reason: &str) {
        info!(
            "[{}] {} ⏭️  Batch {} skipped: {}",
            self.stage_name, self.stage_emoji, self.batch_id, reason
        );
    }

    pub fn log_chunk_plan(&self, total: usize, chunk_size: usize, concurrency_limit: usize) {
        let chunk_count = (total + chunk_size - 1) / chunk_size;
        info!(
            "[{}] {} ⚙️  Processing {} records in {} chunks (chunk size: {}, {} concurrent)",
            self.stage_name, self.stage_emoji, total, chunk_count, chunk_size, concurrency_limit
        );
    }

    pub fn log_chunk_progress(&self, chunk_num: usize, total_chunks: usize, processed: usize, total: usize, succeeded: usize, percent: u8) {
        if chunk_num % 5 == 0 || chunk_num == 1 || chunk_num == total_chunks {
            info!(
                "[{}] {} 📦 Chunk {}/{}: {}/{} records processed ({}%), {} succeeded",
                self.stage_name, self.stage_emoji, chunk_num, total_chunks, processed, total, percent, succeeded
            );
        } else {
            debug!(
                "[{}] chunk {}/{}: {}/{} processed",
                self.stage_name, chunk_num, total_chunks, processed, total
            );
        }
    }

    pub fn log_record_failure(&self, record_id: &str, reason: &str) {
        warn!(
            "[{}] {} ⚠️  Record {} in batch {} failed: {}",
            self.stage_name, self.stage_emoji, record_id, self.batch_id, reason
        );
    }

    pub fn log_chunk_fault(&self, chunk_num: usize, total_chunks: usize, size: usize, reason: &str) {
        error!(
            "[{}] {} ❌ Chunk {}/{} ({} records) of batch {} faulted, continuing with next chunk: {}",
            self.stage_name, self.stage_emoji, chunk_num, total_chunks, size, self.batch_id, reason
        );
    }

    pub fn log_resources(&self, memory_mb: u64) {
        debug!(
            "[{}] {} 🔧 Memory in use: {} MB",
            self.stage_name, self.stage_emoji, memory_mb
        );
    }

    pub fn log_completion(&self, summary_message: &str, failed_records: usize, faulted_chunks: usize) {
        info!(
            "[{}] {} 🎉 COMPLETED batch {} in {:.2?}: {}",
            self.stage_name,
            self.stage_emoji,
            self.batch_id,
            self.start_time.elapsed(),
            summary_message
        );
        if failed_records > 0 || faulted_chunks > 0 {
            warn!(
                "[{}] {} ⚠️  {} record failures, {} faulted chunks",
                self.stage_name, self.stage_emoji, failed_records, faulted_chunks
            );
        }
    }
}

// Pipeline-level logging functions
pub fn log_batch_start(batch_id: &str, run_id: &str, stage_keys: &[String], policy: FailurePolicy) {
    info!("🚀 ===== PAYEE ENRICHMENT BATCH STARTING =====");
    info!("📅 Batch: {} (run {})", batch_id, run_id);
    info!("   • Stages in order: {}", stage_keys.join(" → "));
    info!("   • Failure policy: {}", policy.as_str());
    info!("================================================");
}

pub fn log_stage_starting(batch_id: &str, stage_key: &str, position: usize, stage_count: usize) {
    let (name, emoji) = stage_tag(stage_key);
    info!(
        "🚦 [{}] {} Stage {}/{} starting for batch {}",
        name, emoji, position, stage_count, batch_id
    );
}

pub fn log_stage_finished(batch_id: &str, stage_key: &str, status: StageStatus, message: &str, duration: Duration) {
    let (name, emoji) = stage_tag(stage_key);
    info!(
        "{} [{}] {} Stage {} for batch {} after {:.2?}: {}",
        status.emoji(),
        name,
        emoji,
        status,
        batch_id,
        duration,
        message
    );
}

pub fn log_stage_failed(batch_id: &str, stage_key: &str, duration: Duration, detail: &str) {
    let (name, emoji) = stage_tag(stage_key);
    error!(
        "❌ [{}] {} Stage failed for batch {} after {:.2?}: {}",
        name, emoji, batch_id, duration, detail
    );
}

pub fn log_stage_not_run(batch_id: &str, stage_key: &str, failed_stage: &str) {
    let (name, emoji) = stage_tag(stage_key);
    warn!(
        "⏭️  [{}] {} Not running for batch {}: stage '{}' failed earlier",
        name, emoji, batch_id, failed_stage
    );
}

pub fn log_batch_completion(batch_id: &str, status: BatchStatus, duration: Duration, message: &str) {
    match status {
        BatchStatus::Completed => {
            info!("🎉 ===== BATCH {} COMPLETED in {:.2?} =====", batch_id, duration);
            info!("📈 {}", message);
        }
        _ => {
            warn!(
                "⚠️  ===== BATCH {} ENDED {} after {:.2?} =====",
                batch_id,
                status.as_str().to_uppercase(),
                duration
            );
            warn!("📉 {}", message);
        }
    }
}

pub fn log_watchdog_started(interval: Duration, threshold: Duration) {
    info!(
        "🏥 Starting stall watchdog (checking every {}s, stall threshold {}s)",
        interval.as_secs(),
        threshold.as_secs()
    );
}

pub fn log_watchdog_stall(batch_id: &str, stage_key: Option<&str>, idle_secs: i64) {
    warn!(
        "⏰ Batch {} stalled in stage {}: no activity for {}s, marking stalled",
        batch_id,
        stage_key.unwrap_or("<unknown>"),
        idle_secs
    );
}

pub fn log_watchdog_scan_failed(reason: &str) {
    error!("🏥 Watchdog scan skipped, record store unavailable: {}", reason);
}

pub fn log_watchdog_stopped() {
    info!("🏥 Stall watchdog stopped");
}
