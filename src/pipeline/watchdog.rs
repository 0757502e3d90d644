// src/pipeline/watchdog.rs - Periodic stall detection over in-flight batches
use chrono::{DateTime, Utc};
use log::{error, warn};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::models::{Batch, BatchStatus, BatchUpdate, StageStatus};
use crate::pipeline::fault::FaultKind;
use crate::store::SharedStore;
use crate::utils::pipeline_config::WatchdogConfig;
use crate::utils::progress_bars::logging::{
    log_watchdog_scan_failed, log_watchdog_stall, log_watchdog_started, log_watchdog_stopped,
};

#[derive(Debug, Clone, PartialEq)]
pub struct StallReport {
    pub batch_id: String,
    pub stage: Option<String>,
    pub idle_secs: i64,
    pub message: String,
}

impl StallReport {
    pub fn kind(&self) -> FaultKind {
        FaultKind::Stall
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Scanned { inspected: usize, stalled: Vec<StallReport> },
    /// The active-batch listing failed; nothing was touched and the next cycle retries.
    StoreUnavailable { reason: String },
}

/// Flips batches with no recorded activity for longer than the stall threshold to `stalled`.
///
/// Only status fields are written. Work still running for a flagged batch is not interrupted.
pub struct StallWatchdog {
    store: SharedStore,
    config: WatchdogConfig,
}

impl StallWatchdog {
    /// A zero scan interval is replaced by the default one.
    pub fn new(store: SharedStore, mut config: WatchdogConfig) -> Self {
        if config.scan_interval.is_zero() {
            let fallback = WatchdogConfig::default().scan_interval;
            warn!("Watchdog scan interval is zero, using {:?}", fallback);
            config.scan_interval = fallback;
        }
        Self { store, config }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    fn is_stalled(&self, batch: &Batch, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.config.stall_threshold) {
            Ok(threshold) => batch.idle_for(now) > threshold,
            Err(_) => false,
        }
    }

    pub async fn scan(&self) -> ScanOutcome {
        self.scan_at(Utc::now()).await
    }

    /// One watch cycle evaluated at `now`.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> ScanOutcome {
        let batches = match self.store.list_active_batches().await {
            Ok(batches) => batches,
            Err(e) => {
                let reason = format!("{:#}", e);
                log_watchdog_scan_failed(&reason);
                return ScanOutcome::StoreUnavailable { reason };
            }
        };

        let inspected = batches.len();
        let mut stalled = Vec::new();
        for batch in batches.iter().filter(|b| self.is_stalled(b, now)) {
            let idle_secs = batch.idle_for(now).num_seconds();
            let stage = batch.in_flight_stage();
            let message = format!("stalled: no activity for {}s", idle_secs);

            let mut update = BatchUpdate::new()
                .status(BatchStatus::Stalled)
                .current_step("Stalled")
                .message(message.clone());
            if let Some(key) = &stage {
                update = update.stage_status(key, StageStatus::Error);
            }

            match self.store.update_batch(&batch.id, update).await {
                Ok(()) => {
                    log_watchdog_stall(&batch.id, stage.as_deref(), idle_secs);
                    stalled.push(StallReport {
                        batch_id: batch.id.clone(),
                        stage,
                        idle_secs,
                        message,
                    });
                }
                Err(e) => error!(
                    "Failed to mark batch {} as stalled, retrying next cycle: {:#}",
                    batch.id, e
                ),
            }
        }

        ScanOutcome::Scanned { inspected, stalled }
    }

    /// Scans every `scan_interval` until `shutdown` turns true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        log_watchdog_started(self.config.scan_interval, self.config.stall_threshold);
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log_watchdog_stopped();
    }
}
