// src/pipeline/fault.rs
use std::fmt;

/// Granularity at which a failure was contained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// One record's operation failed; the rest of its chunk is unaffected.
    Record,
    /// A chunk's orchestration failed; its counts are dropped and the stage continues.
    Chunk,
    /// The stage as a whole failed; the batch fails with it.
    Stage,
    /// No activity within the stall threshold.
    Stall,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Record => "record",
            FaultKind::Chunk => "chunk",
            FaultKind::Stage => "stage",
            FaultKind::Stall => "stall",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure that escaped a stage.
///
/// `message` is safe to persist as user-facing text. `detail` holds the full error chain for logs.
#[derive(Debug, Clone, thiserror::Error)]
#[error("stage '{stage}' failed: {message}")]
pub struct StageFault {
    pub stage: String,
    pub message: String,
    pub detail: String,
}

impl StageFault {
    pub fn from_error(stage: &str, err: &anyhow::Error) -> Self {
        Self {
            stage: stage.to_string(),
            message: err.to_string(),
            detail: format!("{:#}", err),
        }
    }

    pub fn kind(&self) -> FaultKind {
        FaultKind::Stage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_stage_fault_keeps_chain_out_of_message() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("connection refused"));
        let err = err.context("Failed to load records of batch b-1").unwrap_err();

        let fault = StageFault::from_error("supplier_match", &err);
        assert_eq!(fault.message, "Failed to load records of batch b-1");
        assert!(fault.detail.contains("connection refused"));
        assert_eq!(fault.kind(), FaultKind::Stage);
        assert_eq!(
            fault.to_string(),
            "stage 'supplier_match' failed: Failed to load records of batch b-1"
        );
    }
}
