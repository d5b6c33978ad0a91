//! Backend-specific classification of native database errors.
//!
//! Each backend reports failures in its own vocabulary (SQLSTATE, MySQL error
//! numbers, SQLite result codes). The classifiers map them onto [`ErrorKind`]
//! so retry and abort decisions never depend on message text.

use crate::error::{DbError, ErrorKind};
use crate::models::DatabaseType;
use sqlx::error::DatabaseError;
use sqlx::mysql::MySqlDatabaseError;

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, err: &(dyn DatabaseError + 'static)) -> ErrorKind;
}

/// Classifies by SQLSTATE class.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresClassifier;

impl PostgresClassifier {
    pub fn classify_sqlstate(code: &str) -> ErrorKind {
        match code {
            // admin_shutdown, crash_shutdown, cannot_connect_now, too_many_connections
            "57P01" | "57P02" | "57P03" | "53300" => ErrorKind::Connection,
            c if c.starts_with("08") => ErrorKind::Connection,
            // query_canceled (statement_timeout), lock_not_available
            "57014" | "55P03" => ErrorKind::Timeout,
            _ => ErrorKind::Database,
        }
    }
}

impl ErrorClassifier for PostgresClassifier {
    fn classify(&self, err: &(dyn DatabaseError + 'static)) -> ErrorKind {
        err.code()
            .map(|c| Self::classify_sqlstate(&c))
            .unwrap_or(ErrorKind::Database)
    }
}

/// Classifies by MySQL server/client error number.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlClassifier;

impl MySqlClassifier {
    pub fn classify_number(number: u16) -> ErrorKind {
        match number {
            1040 | 1042 | 1043 | 1047 | 1053 | 1129 | 1130 | 2002 | 2003 | 2006 | 2013
            | 2055 => ErrorKind::Connection,
            // lock wait timeout, max_execution_time exceeded
            1205 | 3024 => ErrorKind::Timeout,
            _ => ErrorKind::Database,
        }
    }
}

impl ErrorClassifier for MySqlClassifier {
    fn classify(&self, err: &(dyn DatabaseError + 'static)) -> ErrorKind {
        if let Some(mysql) = err.try_downcast_ref::<MySqlDatabaseError>() {
            let kind = Self::classify_number(mysql.number());
            if kind != ErrorKind::Database {
                return kind;
            }
        }
        match err.code().as_deref() {
            Some("08S01") => ErrorKind::Connection,
            Some(c) if c.starts_with("08") => ErrorKind::Connection,
            _ => ErrorKind::Database,
        }
    }
}

/// Classifies by primary result code (low byte of the extended code).
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteClassifier;

impl SqliteClassifier {
    pub fn classify_code(code: i32) -> ErrorKind {
        match code & 0xff {
            // SQLITE_BUSY, SQLITE_LOCKED
            5 | 6 => ErrorKind::Timeout,
            // SQLITE_IOERR, SQLITE_CANTOPEN, SQLITE_NOTADB
            10 | 14 | 26 => ErrorKind::Connection,
            _ => ErrorKind::Database,
        }
    }
}

impl ErrorClassifier for SqliteClassifier {
    fn classify(&self, err: &(dyn DatabaseError + 'static)) -> ErrorKind {
        err.code()
            .and_then(|c| c.parse::<i32>().ok())
            .map(Self::classify_code)
            .unwrap_or(ErrorKind::Database)
    }
}

pub fn classifier_for(db_type: DatabaseType) -> &'static dyn ErrorClassifier {
    match db_type {
        DatabaseType::PostgreSQL => &PostgresClassifier,
        DatabaseType::MySQL => &MySqlClassifier,
        DatabaseType::SQLite => &SqliteClassifier,
    }
}

/// Convert a sqlx error raised by a `db_type` backend into a [`DbError`].
pub fn translate(err: sqlx::Error, db_type: DatabaseType) -> DbError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            let native_code = db_err.code().map(|c| c.into_owned());
            match classifier_for(db_type).classify(db_err.as_ref()) {
                ErrorKind::Connection => DbError::connection(message),
                ErrorKind::Timeout => DbError::database_timeout(message, native_code),
                _ => DbError::Database {
                    message,
                    native_code,
                    original: Some(Box::new(sqlx::Error::Database(db_err))),
                },
            }
        }
        other => DbError::from(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_sqlstate() {
        assert_eq!(
            PostgresClassifier::classify_sqlstate("08006"),
            ErrorKind::Connection
        );
        assert_eq!(
            PostgresClassifier::classify_sqlstate("57P01"),
            ErrorKind::Connection
        );
        assert_eq!(
            PostgresClassifier::classify_sqlstate("57014"),
            ErrorKind::Timeout
        );
        // unique_violation is a plain database error
        assert_eq!(
            PostgresClassifier::classify_sqlstate("23505"),
            ErrorKind::Database
        );
    }

    #[test]
    fn test_mysql_numbers() {
        assert_eq!(MySqlClassifier::classify_number(2013), ErrorKind::Connection);
        assert_eq!(MySqlClassifier::classify_number(1040), ErrorKind::Connection);
        assert_eq!(MySqlClassifier::classify_number(1205), ErrorKind::Timeout);
        assert_eq!(MySqlClassifier::classify_number(1062), ErrorKind::Database);
    }

    #[test]
    fn test_sqlite_primary_codes() {
        assert_eq!(SqliteClassifier::classify_code(14), ErrorKind::Connection);
        // SQLITE_IOERR_READ (extended) keeps its primary class
        assert_eq!(SqliteClassifier::classify_code(266), ErrorKind::Connection);
        assert_eq!(SqliteClassifier::classify_code(5), ErrorKind::Timeout);
        // SQLITE_LOCKED_SHAREDCACHE
        assert_eq!(SqliteClassifier::classify_code(262), ErrorKind::Timeout);
        // SQLITE_CONSTRAINT_PRIMARYKEY
        assert_eq!(SqliteClassifier::classify_code(1555), ErrorKind::Database);
    }

    #[test]
    fn test_translate_non_database_error() {
        let err = translate(sqlx::Error::PoolClosed, DatabaseType::PostgreSQL);
        assert_eq!(err.kind(), ErrorKind::Connection);
    }
}
