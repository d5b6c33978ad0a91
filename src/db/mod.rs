//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Dual-backend pool management with retry and health checks
//! - Query execution and backend error classification
//! - Transactional units of work and repositories
//! - Column introspection and type mappings
//! - Database dispatch macros for reducing code duplication

pub mod classifier;
pub mod database;
pub mod dialect;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod manager;
pub mod params;
pub mod pool;
pub mod repository;
pub mod retry;
pub mod schema;
pub mod types;
pub mod unit_of_work;

pub use classifier::{ErrorClassifier, MySqlClassifier, PostgresClassifier, SqliteClassifier};
pub use database::Database;
pub use manager::{
    BackendHealth, BackendPoolStatus, BackendState, HealthStatus, PoolManager, PoolState,
    PoolStatus, PooledConnection,
};
pub use pool::{ConnectionSource, Connector, DbConnection, DbPool, SqlxConnector};
pub use repository::Repository;
pub use retry::RetryPolicy;
pub use unit_of_work::UnitOfWork;
