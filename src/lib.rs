//! Dual-backend data-access core.
//!
//! Two SQL backends, A and B (SQLite, PostgreSQL or MySQL in any
//! combination), behind one resilient pool manager, with transactional
//! repositories on top and tooling to keep the two backends in sync.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod sync;

pub use config::{Config, CoreSettings};
pub use db::{Database, PoolManager};
pub use error::{DbError, DbResult, ErrorPayload};
pub use sync::{DataSynchronizer, SyncScheduler};
