//! Cross-backend consistency, comparison and synchronization.
//!
//! - [`ConsistencyChecker`]: row counts and missing ids per table
//! - [`DataComparisonEngine`]: schema and record-level diffs
//! - [`ConflictResolver`]: per-record conflict strategies
//! - [`DataSynchronizer`]: batched full and incremental runs
//! - [`SyncScheduler`]: persisted recurring runs

pub mod comparison;
pub mod conflict;
pub mod consistency;
pub mod metadata;
pub mod scheduler;
pub mod synchronizer;

pub use comparison::{
    ComparisonReport, ComparisonSummary, DataComparisonEngine, FieldDifference, RecordComparison,
    RecordStats, SchemaComparison, SchemaDifference, SchemaDifferenceKind, TableComparison,
    compare_records,
};
pub use conflict::{ConflictResolver, CustomRule};
pub use consistency::ConsistencyChecker;
pub use metadata::{Checkpoint, InMemoryMetadataStore, MetadataStore, SqliteMetadataStore};
pub use scheduler::SyncScheduler;
pub use synchronizer::DataSynchronizer;
