//! Transactional unit of work.
//!
//! One `UnitOfWork` owns at most one connection, checked out by
//! [`begin`](UnitOfWork::begin) and returned on commit or rollback. The `&mut
//! self` API confines it to a single task.

use crate::db::Database;
use crate::db::dialect::begin_statement;
use crate::db::executor;
use crate::db::manager::PooledConnection;
use crate::db::repository::Repository;
use crate::error::{DbError, DbResult};
use crate::models::{Backend, DatabaseType, Row, SqlValue, TransactionState};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct UnitOfWork {
    id: Uuid,
    backend: Backend,
    db: Database,
    conn: Option<PooledConnection>,
    state: TransactionState,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn state_name(state: TransactionState) -> &'static str {
    match state {
        TransactionState::Pending => "pending",
        TransactionState::Active => "active",
        TransactionState::Committed => "committed",
        TransactionState::RolledBack => "rolled back",
    }
}

impl UnitOfWork {
    pub(crate) fn new(db: Database, backend: Backend) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend,
            db,
            conn: None,
            state: TransactionState::Pending,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db.db_type(self.backend)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Check out a connection and open the transaction.
    pub async fn begin(&mut self) -> DbResult<()> {
        if self.state != TransactionState::Pending {
            return Err(DbError::transaction(format!(
                "begin() called on a unit of work that is already {}",
                state_name(self.state)
            )));
        }

        let mut conn = self.db.get_connection(self.backend).await?;
        let sql = begin_statement(self.db_type());
        if let Err(e) =
            executor::execute(conn.connection()?, sql, &[], self.db.query_timeout()).await
        {
            if e.is_transient() {
                conn.mark_unhealthy();
            }
            return Err(e);
        }

        self.conn = Some(conn);
        self.state = TransactionState::Active;
        info!(uow = %self.id, backend = %self.backend, "Transaction started");
        Ok(())
    }

    fn active_connection(&mut self) -> DbResult<&mut PooledConnection> {
        if self.state != TransactionState::Active {
            return Err(DbError::transaction(format!(
                "no active transaction (unit of work is {})",
                state_name(self.state)
            )));
        }
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::internal("active unit of work without a connection"))
    }

    /// Run a statement inside the transaction and return its rows.
    pub async fn query(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        let timeout = self.db.query_timeout();
        let conn = self.active_connection()?;
        executor::fetch_all(conn.connection()?, sql, params, timeout).await
    }

    /// Run a statement inside the transaction and return affected rows.
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        let timeout = self.db.query_timeout();
        let conn = self.active_connection()?;
        executor::execute(conn.connection()?, sql, params, timeout).await
    }

    /// A repository for `table` bound to this transaction.
    pub fn repository(&mut self, table: &str) -> DbResult<Repository<'_>> {
        let spec = self.db.table_spec(table)?;
        Ok(Repository::new(self, spec))
    }

    /// Commit. If the commit itself fails the transaction is rolled back and
    /// the commit error returned.
    pub async fn commit(&mut self) -> DbResult<()> {
        if self.state != TransactionState::Active {
            return Err(DbError::transaction(format!(
                "cannot commit a unit of work that is {}",
                state_name(self.state)
            )));
        }

        match self.execute("COMMIT", &[]).await {
            Ok(_) => {
                self.state = TransactionState::Committed;
                self.release(true);
                info!(uow = %self.id, backend = %self.backend, "Transaction committed");
                Ok(())
            }
            Err(e) => {
                warn!(
                    uow = %self.id,
                    backend = %self.backend,
                    error = %e,
                    "Commit failed, rolling back"
                );
                let rolled_back = self.execute("ROLLBACK", &[]).await.is_ok();
                self.state = TransactionState::RolledBack;
                self.release(rolled_back);
                Err(e)
            }
        }
    }

    /// Roll back. A second rollback is a no-op; rolling back after commit is
    /// an error.
    pub async fn rollback(&mut self) -> DbResult<()> {
        match self.state {
            TransactionState::RolledBack => Ok(()),
            TransactionState::Committed => Err(DbError::transaction(
                "cannot roll back a committed unit of work",
            )),
            TransactionState::Pending => {
                self.state = TransactionState::RolledBack;
                Ok(())
            }
            TransactionState::Active => {
                let result = self.execute("ROLLBACK", &[]).await;
                self.state = TransactionState::RolledBack;
                self.release(result.is_ok());
                match result {
                    Ok(_) => {
                        info!(uow = %self.id, backend = %self.backend, "Transaction rolled back");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(
                            uow = %self.id,
                            backend = %self.backend,
                            error = %e,
                            "Rollback failed, discarding connection"
                        );
                        Err(e)
                    }
                }
            }
        }
    }

    fn release(&mut self, reusable: bool) {
        if let Some(mut conn) = self.conn.take() {
            if !reusable {
                conn.mark_unhealthy();
            }
            conn.release();
        }
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.state != TransactionState::Active {
            return;
        }
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        warn!(
            uow = %self.id,
            backend = %self.backend,
            "Unit of work dropped while active, rolling back"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let timeout = self.db.query_timeout();
                let id = self.id;
                handle.spawn(async move {
                    let result = match conn.connection() {
                        Ok(c) => executor::execute(c, "ROLLBACK", &[], timeout).await,
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(_) => debug!(uow = %id, "Dropped unit of work rolled back"),
                        Err(e) => {
                            warn!(uow = %id, error = %e, "Rollback of dropped unit of work failed");
                            conn.mark_unhealthy();
                        }
                    }
                    conn.release();
                });
            }
            Err(_) => {
                // Closing the connection aborts the transaction server-side.
                conn.mark_unhealthy();
                conn.release();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(state_name(TransactionState::RolledBack), "rolled back");
        assert_eq!(state_name(TransactionState::Pending), "pending");
    }
}
