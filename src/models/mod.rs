//! Data models shared by the pool, repository and synchronization layers.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod record;
pub mod schedule;
pub mod schema;
pub mod sync;

// Re-export commonly used types
pub use connection::{Backend, ConnectionConfig, DatabaseType, TransactionState};
pub use query::{DEFAULT_QUERY_TIMEOUT_SECS, Row, SqlValue, value_as_i64, value_as_id};
pub use record::{
    AUDIT_COLUMNS, DEFAULT_PAGE_LIMIT, FieldSpec, MAX_PAGE_LIMIT, PaginatedResult, Pagination,
    Record, SearchCriteria, Sort, SortOrder, TableSpec,
};
pub use schedule::{ExecutionOutcome, Schedule, ScheduleConfig, ScheduleOutcome, SyncInterval};
pub use schema::{CanonicalType, ColumnDefinition};
pub use sync::{
    ChosenSource, Conflict, ConflictType, ConsistencyReport, ConsistencySummary, Discrepancy,
    DiscrepancyKind, MissingRecords, Resolution, ResolutionStrategy, SyncDirection, SyncEvent,
    SyncResult, ValidationReport,
};
