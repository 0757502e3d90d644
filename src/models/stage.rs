// src/models/stage.rs
use serde::{Deserialize, Serialize};

/// Static metadata for one pipeline stage. Immutable once the pipeline is assembled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub key: String,
    pub label: String,
    pub enabled: bool,
    pub order: i32,
    /// Batch column holding this stage's status.
    pub status_field: String,
    /// Batch column holding this stage's progress percentage.
    pub progress_field: String,
    /// Batch column holding this stage's completion timestamp.
    pub completed_field: String,
}

impl StageDescriptor {
    pub fn new(key: &str, label: &str, order: i32) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            enabled: true,
            order,
            status_field: format!("{}_status", key),
            progress_field: format!("{}_progress", key),
            completed_field: format!("{}_completed_at", key),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }
}

/// Indices of enabled descriptors in ascending order. Ties keep declaration order.
pub fn execution_order(descriptors: &[&StageDescriptor]) -> Vec<usize> {
    let mut indices: Vec<usize> = descriptors
        .iter()
        .enumerate()
        .filter(|(_, d)| d.enabled)
        .map(|(i, _)| i)
        .collect();
    // sort_by_key is stable
    indices.sort_by_key(|&i| descriptors[i].order);
    indices
}
