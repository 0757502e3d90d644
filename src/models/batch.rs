// src/models/batch.rs
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type BatchId = String;

/// Status of one stage for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Processing,
    Completed,
    Skipped,
    Error,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Processing => "processing",
            StageStatus::Completed => "completed",
            StageStatus::Skipped => "skipped",
            StageStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(StageStatus::Pending),
            "processing" => Some(StageStatus::Processing),
            "completed" => Some(StageStatus::Completed),
            "skipped" => Some(StageStatus::Skipped),
            "error" => Some(StageStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Skipped | StageStatus::Error
        )
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            StageStatus::Pending => "⏳",
            StageStatus::Processing => "▶️",
            StageStatus::Completed => "✅",
            StageStatus::Skipped => "⏭️",
            StageStatus::Error => "❌",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Stalled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Stalled => "stalled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(BatchStatus::Pending),
            "processing" => Some(BatchStatus::Processing),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            "stalled" => Some(BatchStatus::Stalled),
            _ => None,
        }
    }

    /// Terminal statuses release anyone polling for completion.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Stalled
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    /// Integer percentage, 0..=100.
    pub progress: u8,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Default for StageState {
    fn default() -> Self {
        Self {
            status: StageStatus::Pending,
            progress: 0,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub total_records: usize,
    pub status: BatchStatus,
    /// Keyed by stage key.
    pub stages: BTreeMap<String, StageState>,
    pub current_stage: Option<String>,
    pub current_step: Option<String>,
    pub progress_message: Option<String>,
    pub last_activity_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(id: impl Into<BatchId>, total_records: usize, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            total_records,
            status: BatchStatus::Pending,
            stages: BTreeMap::new(),
            current_stage: None,
            current_step: None,
            progress_message: None,
            last_activity_at: now,
        }
    }

    pub fn stage(&self, key: &str) -> StageState {
        self.stages.get(key).cloned().unwrap_or_default()
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_activity_at
    }

    /// The stage the watchdog should blame: the recorded current stage, or any stage still marked processing.
    pub fn in_flight_stage(&self) -> Option<String> {
        if let Some(key) = &self.current_stage {
            if !self.stage(key).status.is_terminal() {
                return Some(key.clone());
            }
        }
        self.stages
            .iter()
            .find(|(_, state)| state.status == StageStatus::Processing)
            .map(|(key, _)| key.clone())
    }
}

/// Per-stage fields of a batch update. Only `Some` fields are written.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFieldUpdate {
    pub key: String,
    pub status: Option<StageStatus>,
    pub progress: Option<u8>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A partial write against a batch. Every applied update also refreshes `last_activity_at`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchUpdate {
    pub status: Option<BatchStatus>,
    pub current_stage: Option<String>,
    pub current_step: Option<String>,
    pub progress_message: Option<String>,
    pub stage: Option<StageFieldUpdate>,
}

impl BatchUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: BatchStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn current_stage(mut self, key: impl Into<String>) -> Self {
        self.current_stage = Some(key.into());
        self
    }

    pub fn current_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.progress_message = Some(message.into());
        self
    }

    pub fn stage_status(mut self, key: &str, status: StageStatus) -> Self {
        self.stage_fields(key).status = Some(status);
        self
    }

    pub fn stage_progress(mut self, key: &str, progress: u8) -> Self {
        self.stage_fields(key).progress = Some(progress.min(100));
        self
    }

    pub fn stage_completed_at(mut self, key: &str, at: DateTime<Utc>) -> Self {
        self.stage_fields(key).completed_at = Some(at);
        self
    }

    fn stage_fields(&mut self, key: &str) -> &mut StageFieldUpdate {
        let fields = self.stage.get_or_insert_with(|| StageFieldUpdate {
            key: key.to_string(),
            status: None,
            progress: None,
            completed_at: None,
        });
        if fields.key != key {
            // One update addresses one stage; a different key starts over.
            *fields = StageFieldUpdate {
                key: key.to_string(),
                status: None,
                progress: None,
                completed_at: None,
            };
        }
        fields
    }

    pub fn apply_to(&self, batch: &mut Batch, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            batch.status = status;
        }
        if let Some(stage) = &self.current_stage {
            batch.current_stage = Some(stage.clone());
        }
        if let Some(step) = &self.current_step {
            batch.current_step = Some(step.clone());
        }
        if let Some(message) = &self.progress_message {
            batch.progress_message = Some(message.clone());
        }
        if let Some(fields) = &self.stage {
            let state = batch.stages.entry(fields.key.clone()).or_default();
            if let Some(status) = fields.status {
                state.status = status;
            }
            if let Some(progress) = fields.progress {
                state.progress = progress;
            }
            if let Some(at) = fields.completed_at {
                state.completed_at = Some(at);
            }
        }
        batch.last_activity_at = now;
    }
}
