//! Batch reconciliation: records, report and the orchestrating engine.

pub mod engine;
pub mod record;
pub mod report;

pub use engine::{SyncContext, SyncEngine};
pub use record::{EntityState, OrderRecord, RecordOutcome, SyncAction};
pub use report::SyncReport;
