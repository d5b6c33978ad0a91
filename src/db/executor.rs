//! Statement execution on a checked-out connection.
//!
//! This module provides query execution functionality with support for:
//! - Parameterized queries
//! - Query timeouts
//! - Backend-specific error classification
//!
//! # Architecture
//!
//! The executor uses database-specific implementations organized in submodules:
//! - `mysql`: MySQL-specific query and write operations
//! - `postgres`: PostgreSQL-specific query and write operations
//! - `sqlite`: SQLite-specific query and write operations
//!
//! Each submodule provides identical functionality adapted to the database's type system.

use crate::db::classifier::translate;
use crate::db::pool::DbConnection;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Row, SqlValue};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

/// Run a statement and decode every returned row.
pub async fn fetch_all(
    conn: &mut DbConnection,
    sql: &str,
    params: &[SqlValue],
    query_timeout: Duration,
) -> DbResult<Vec<Row>> {
    let start = Instant::now();
    let rows = crate::impl_db_dispatch!(DbConnection, conn, {
        MySql(c) => mysql::fetch_rows(c, sql, params, query_timeout).await?,
        Postgres(c) => postgres::fetch_rows(c, sql, params, query_timeout).await?,
        SQLite(c) => sqlite::fetch_rows(c, sql, params, query_timeout).await?,
    });
    debug!(
        rows = rows.len(),
        params = params.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Query executed"
    );
    Ok(rows)
}

/// Run a statement and return the number of affected rows.
pub async fn execute(
    conn: &mut DbConnection,
    sql: &str,
    params: &[SqlValue],
    query_timeout: Duration,
) -> DbResult<u64> {
    let start = Instant::now();
    let affected = crate::impl_db_dispatch!(DbConnection, conn, {
        MySql(c) => mysql::execute_write(c, sql, params, query_timeout).await?,
        Postgres(c) => postgres::execute_write(c, sql, params, query_timeout).await?,
        SQLite(c) => sqlite::execute_write(c, sql, params, query_timeout).await?,
    });
    debug!(
        rows_affected = affected,
        params = params.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Statement executed"
    );
    Ok(affected)
}

// =============================================================================
// Common Helper Functions
// =============================================================================

fn decode_rows<R: RowToJson>(
    result: Result<Result<Vec<R>, sqlx::Error>, tokio::time::error::Elapsed>,
    db_type: DatabaseType,
    query_timeout: Duration,
) -> DbResult<Vec<Row>> {
    match result {
        Ok(Ok(rows)) => Ok(rows.iter().map(RowToJson::to_json_map).collect()),
        Ok(Err(e)) => Err(translate(e, db_type)),
        Err(_) => Err(timeout_error("query execution", query_timeout)),
    }
}

fn timeout_error(operation: &str, timeout: Duration) -> DbError {
    DbError::timeout(operation, timeout)
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// The code structure is intentionally parallel to make differences obvious.

mod mysql {
    use super::*;
    use crate::db::params::bind_mysql_param;
    use sqlx::MySql;
    use sqlx::pool::PoolConnection;

    pub async fn fetch_rows(
        conn: &mut PoolConnection<MySql>,
        sql: &str,
        params: &[SqlValue],
        query_timeout: Duration,
    ) -> DbResult<Vec<Row>> {
        // When params is empty, use raw SQL to avoid prepared statement issues
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, (&mut **conn).fetch_all(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            timeout(query_timeout, query.fetch_all(&mut **conn)).await
        };
        decode_rows(result, DatabaseType::MySQL, query_timeout)
    }

    pub async fn execute_write(
        conn: &mut PoolConnection<MySql>,
        sql: &str,
        params: &[SqlValue],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        // Transaction control statements don't support prepared statements
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, (&mut **conn).execute(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            timeout(query_timeout, query.execute(&mut **conn)).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(translate(e, DatabaseType::MySQL)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

mod postgres {
    use super::*;
    use crate::db::params::bind_postgres_param;
    use sqlx::Postgres;
    use sqlx::pool::PoolConnection;

    pub async fn fetch_rows(
        conn: &mut PoolConnection<Postgres>,
        sql: &str,
        params: &[SqlValue],
        query_timeout: Duration,
    ) -> DbResult<Vec<Row>> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, (&mut **conn).fetch_all(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_postgres_param(query, param);
            }
            timeout(query_timeout, query.fetch_all(&mut **conn)).await
        };
        decode_rows(result, DatabaseType::PostgreSQL, query_timeout)
    }

    pub async fn execute_write(
        conn: &mut PoolConnection<Postgres>,
        sql: &str,
        params: &[SqlValue],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, (&mut **conn).execute(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_postgres_param(query, param);
            }
            timeout(query_timeout, query.execute(&mut **conn)).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(translate(e, DatabaseType::PostgreSQL)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::bind_sqlite_param;
    use sqlx::Sqlite;
    use sqlx::pool::PoolConnection;

    pub async fn fetch_rows(
        conn: &mut PoolConnection<Sqlite>,
        sql: &str,
        params: &[SqlValue],
        query_timeout: Duration,
    ) -> DbResult<Vec<Row>> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, (&mut **conn).fetch_all(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            timeout(query_timeout, query.fetch_all(&mut **conn)).await
        };
        decode_rows(result, DatabaseType::SQLite, query_timeout)
    }

    pub async fn execute_write(
        conn: &mut PoolConnection<Sqlite>,
        sql: &str,
        params: &[SqlValue],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, (&mut **conn).execute(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            timeout(query_timeout, query.execute(&mut **conn)).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(translate(e, DatabaseType::SQLite)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn sqlite_conn() -> (sqlx::SqlitePool, DbConnection) {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let conn = pool.acquire().await.unwrap();
        (pool, DbConnection::SQLite(conn))
    }

    #[tokio::test]
    async fn test_execute_and_fetch_with_params() {
        let (_pool, mut conn) = sqlite_conn().await;
        let timeout = Duration::from_secs(5);

        execute(
            &mut conn,
            "CREATE TABLE t (id TEXT PRIMARY KEY, n INTEGER)",
            &[],
            timeout,
        )
        .await
        .unwrap();
        let affected = execute(
            &mut conn,
            "INSERT INTO t (id, n) VALUES (?, ?), (?, ?)",
            &["a".into(), 1i64.into(), "b".into(), 2i64.into()],
            timeout,
        )
        .await
        .unwrap();
        assert_eq!(affected, 2);

        let rows = fetch_all(&mut conn, "SELECT id, n FROM t WHERE n > ?", &[1i64.into()], timeout)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&json!("b")));
        assert_eq!(rows[0].get("n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_constraint_violation_is_database_error() {
        let (_pool, mut conn) = sqlite_conn().await;
        let timeout = Duration::from_secs(5);
        execute(&mut conn, "CREATE TABLE t (id TEXT PRIMARY KEY)", &[], timeout)
            .await
            .unwrap();
        execute(&mut conn, "INSERT INTO t (id) VALUES ('x')", &[], timeout)
            .await
            .unwrap();

        let err = execute(&mut conn, "INSERT INTO t (id) VALUES ('x')", &[], timeout)
            .await
            .unwrap_err();
        match err {
            DbError::Database { native_code, .. } => assert!(native_code.is_some()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_syntax_error_is_not_retryable() {
        let (_pool, mut conn) = sqlite_conn().await;
        let err = fetch_all(&mut conn, "SELEC 1", &[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DATABASE_ERROR");
        assert!(!err.is_retryable());
    }
}
