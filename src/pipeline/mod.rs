// src/pipeline/mod.rs
pub mod completion;
pub mod fault;
pub mod orchestrator;
pub mod runner;
pub mod stage;
pub mod stages;
pub mod supervisor;
pub mod watchdog;

pub use completion::wait_for_completion;
pub use fault::{FaultKind, StageFault};
pub use orchestrator::{BatchOutcome, PipelineOrchestrator, StageReport};
pub use runner::{ChunkedRunner, OperationOutcome, ProgressReporter, RecordOutcome, RunSummary};
pub use stage::{Stage, StageOutcome};
pub use supervisor::{PendingTracker, PipelineSupervisor, SupervisorHandle};
pub use watchdog::{ScanOutcome, StallReport, StallWatchdog};
