//! Unified query entry point over both backends.

use crate::clock::{Clock, SystemClock};
use crate::db::dialect::validate_identifier;
use crate::db::executor;
use crate::db::manager::{PoolManager, PooledConnection};
use crate::db::unit_of_work::UnitOfWork;
use crate::error::{DbError, DbResult};
use crate::models::{
    Backend, DEFAULT_QUERY_TIMEOUT_SECS, DatabaseType, Row, SqlValue, TableSpec,
};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Cheap to clone; every clone shares the same pool manager.
#[derive(Debug, Clone)]
pub struct Database {
    pool: Arc<PoolManager>,
    default_backend: Backend,
    query_timeout: Duration,
    tables: Arc<HashMap<String, TableSpec>>,
    clock: Arc<dyn Clock>,
}

impl Database {
    pub fn new(pool: Arc<PoolManager>) -> Self {
        Self {
            pool,
            default_backend: Backend::A,
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            tables: Arc::new(HashMap::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Backend used when a call doesn't name one.
    pub fn with_default_backend(mut self, backend: Backend) -> Self {
        self.default_backend = backend;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Register managed tables.
    ///
    /// Once any table is registered, repositories and the synchronizer refuse
    /// tables that are not.
    pub fn with_tables(mut self, tables: impl IntoIterator<Item = TableSpec>) -> Self {
        self.tables = Arc::new(tables.into_iter().map(|t| (t.name.clone(), t)).collect());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn default_backend(&self) -> Backend {
        self.default_backend
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    pub fn db_type(&self, backend: Backend) -> DatabaseType {
        self.pool.db_type(backend)
    }

    /// Registered tables, sorted by name.
    pub fn tables(&self) -> Vec<TableSpec> {
        let mut tables: Vec<TableSpec> = self.tables.values().cloned().collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        tables
    }

    /// Look up a managed table.
    pub fn table_spec(&self, name: &str) -> DbResult<TableSpec> {
        validate_identifier(name)?;
        if self.tables.is_empty() {
            return Ok(TableSpec::new(name));
        }
        self.tables.get(name).cloned().ok_or_else(|| {
            DbError::invalid_field("table", format!("table '{}' is not registered", name))
        })
    }

    pub async fn get_connection(&self, backend: Backend) -> DbResult<PooledConnection> {
        self.pool.get_connection(backend).await
    }

    /// Run a statement and return its rows.
    ///
    /// The connection goes back to the pool on every exit path, including
    /// when the returned future is dropped.
    pub async fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
        backend: Option<Backend>,
    ) -> DbResult<Vec<Row>> {
        let backend = backend.unwrap_or(self.default_backend);
        let mut conn = self.get_connection(backend).await?;
        let result = executor::fetch_all(conn.connection()?, sql, params, self.query_timeout).await;
        finish(&mut conn, &result);
        result
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[SqlValue],
        backend: Option<Backend>,
    ) -> DbResult<u64> {
        let backend = backend.unwrap_or(self.default_backend);
        let mut conn = self.get_connection(backend).await?;
        let result = executor::execute(conn.connection()?, sql, params, self.query_timeout).await;
        finish(&mut conn, &result);
        result
    }

    /// A unit of work on the default backend.
    pub fn create_unit_of_work(&self) -> UnitOfWork {
        self.create_unit_of_work_on(self.default_backend)
    }

    pub fn create_unit_of_work_on(&self, backend: Backend) -> UnitOfWork {
        UnitOfWork::new(self.clone(), backend)
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    ///
    /// ```ignore
    /// let record = db
    ///     .transaction(Backend::A, |uow| {
    ///         Box::pin(async move { uow.repository("projects")?.create(data).await })
    ///     })
    ///     .await?;
    /// ```
    pub async fn transaction<T, F>(&self, backend: Backend, f: F) -> DbResult<T>
    where
        T: Send,
        F: for<'u> FnOnce(&'u mut UnitOfWork) -> BoxFuture<'u, DbResult<T>> + Send,
    {
        let mut uow = self.create_unit_of_work_on(backend);
        uow.begin().await?;
        match f(&mut uow).await {
            Ok(value) => {
                uow.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(
                        backend = %backend,
                        error = %rollback_err,
                        "Rollback after failed transaction body also failed"
                    );
                }
                Err(e)
            }
        }
    }
}

/// Release a connection after a statement, discarding it if the failure
/// left it in an unknown state.
fn finish<T>(conn: &mut PooledConnection, result: &DbResult<T>) {
    if let Err(e) = result {
        warn!(backend = %conn.backend(), code = e.code(), error = %e, "Statement failed");
        if e.is_transient() {
            conn.mark_unhealthy();
        }
    }
    conn.release();
}
