pub mod batch;
pub mod record;
pub mod stage;

pub use batch::{Batch, BatchId, BatchStatus, BatchUpdate, StageFieldUpdate, StageState, StageStatus};
pub use record::{
    Classification, LocationHints, PayeeClass, PayeeRecord, RecordId, RecordUpdate, StageEnrichment,
};
pub use stage::{execution_order, StageDescriptor};
