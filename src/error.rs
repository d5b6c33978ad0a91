//! Error types for the sync core.
//!
//! Every failure is a [`DbError`] built with `thiserror`. Each variant maps to a
//! stable string code and a coarse [`ErrorKind`] so callers (and the API layer in
//! front of this crate) can decide whether to retry, surface, or abort.

use crate::models::Backend;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Canonical error taxonomy shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    PoolExhausted,
    Database,
    Validation,
    Conflict,
    NotFound,
    SyncAborted,
    Timeout,
    Transaction,
    Configuration,
    Schema,
    Internal,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection {
        message: String,
        backend: Option<Backend>,
    },

    #[error(
        "Connection pool for backend {backend} exhausted, retry after {}ms",
        .retry_after.as_millis()
    )]
    PoolExhausted {
        backend: Backend,
        retry_after: Duration,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// SQLSTATE for PostgreSQL/MySQL, extended result code for SQLite
        native_code: Option<String>,
        #[source]
        original: Option<Box<sqlx::Error>>,
    },

    #[error("Validation failed: {message}")]
    Validation {
        field: Option<String>,
        message: String,
    },

    #[error("Version conflict: {message}")]
    Conflict {
        message: String,
        expected_version: Option<i64>,
        actual_version: Option<i64>,
    },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: String, id: String },

    #[error("Synchronization of '{table}' aborted: {message}")]
    SyncAborted { table: String, message: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// The server gave up on a lock wait or cancelled the statement.
    #[error("Database timed out: {message}")]
    DatabaseTimeout {
        message: String,
        native_code: Option<String>,
    },

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error not tied to a particular backend.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            backend: None,
        }
    }

    /// Create a connection error for one backend.
    pub fn connection_for(backend: Backend, message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            backend: Some(backend),
        }
    }

    pub fn pool_exhausted(backend: Backend, retry_after: Duration) -> Self {
        Self::PoolExhausted {
            backend,
            retry_after,
        }
    }

    /// Create a database error with an optional native code.
    pub fn database(message: impl Into<String>, native_code: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            native_code,
            original: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            field: None,
            message: message.into(),
        }
    }

    /// Create a validation error pointing at a specific field.
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    /// Create an optimistic-lock conflict.
    pub fn version_conflict(id: &str, expected: i64, actual: Option<i64>) -> Self {
        let message = match actual {
            Some(actual) => format!(
                "record '{}' is at version {}, caller expected {}",
                id, actual, expected
            ),
            None => format!("record '{}' changed concurrently (expected version {})", id, expected),
        };
        Self::Conflict {
            message,
            expected_version: Some(expected),
            actual_version: actual,
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn sync_aborted(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SyncAborted {
            table: table.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Create a server-side timeout (lock wait, busy database, statement cancel).
    pub fn database_timeout(message: impl Into<String>, native_code: Option<String>) -> Self {
        Self::DatabaseTimeout {
            message: message.into(),
            native_code,
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Canonical category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::Database { .. } => ErrorKind::Database,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::SyncAborted { .. } => ErrorKind::SyncAborted,
            Self::Timeout { .. } | Self::DatabaseTimeout { .. } => ErrorKind::Timeout,
            Self::Transaction { .. } => ErrorKind::Transaction,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Schema { .. } => ErrorKind::Schema,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code exposed to API consumers.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Connection => "CONNECTION_ERROR",
            ErrorKind::PoolExhausted => "POOL_EXHAUSTED",
            ErrorKind::Database => "DATABASE_ERROR",
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::SyncAborted => "SYNC_ABORTED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Transaction => "TRANSACTION_ERROR",
            ErrorKind::Configuration => "CONFIGURATION_ERROR",
            ErrorKind::Schema => "SCHEMA_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// Human-readable message, same as `Display`.
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Underlying cause, if one is known.
    pub fn cause(&self) -> Option<String> {
        match self {
            Self::Database {
                original,
                native_code,
                ..
            } => original
                .as_ref()
                .map(|e| e.to_string())
                .or_else(|| native_code.as_ref().map(|c| format!("native code {}", c))),
            Self::DatabaseTimeout {
                native_code: Some(code),
                ..
            } => Some(format!("native code {}", code)),
            Self::Connection {
                backend: Some(backend),
                ..
            } => Some(format!("backend {}", backend)),
            Self::Validation {
                field: Some(field), ..
            } => Some(format!("field '{}'", field)),
            _ => None,
        }
    }

    /// Transient failures the pool retries on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::DatabaseTimeout { .. }
        )
    }

    /// Check if the caller may retry this error.
    pub fn is_retryable(&self) -> bool {
        self.is_transient() || matches!(self, Self::PoolExhausted { .. })
    }

    /// Connectivity-class failures abort a whole synchronization run.
    ///
    /// Timeouts are not in this class: a busy row or a slow statement fails
    /// that record only.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::PoolExhausted { .. })
    }

    /// Suggested back-off before retrying, for pool exhaustion.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::PoolExhausted { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Convert sqlx errors to DbError without backend-specific classification.
///
/// Use [`crate::db::classifier::translate`] when the backend type is known.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                let native_code = db_err.code().map(|c| c.into_owned());
                // SQLSTATE class 08 is "connection exception" on every SQL backend.
                if native_code.as_deref().is_some_and(|c| c.starts_with("08")) {
                    return DbError::connection(message);
                }
                DbError::Database {
                    message,
                    native_code,
                    original: Some(Box::new(sqlx::Error::Database(db_err))),
                }
            }
            sqlx::Error::RowNotFound => DbError::not_found("row", "query"),
            sqlx::Error::PoolTimedOut => {
                DbError::timeout("connection pool acquire", Duration::ZERO)
            }
            sqlx::Error::PoolClosed => DbError::connection("Connection pool is closed"),
            sqlx::Error::Io(io_err) => DbError::connection(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => DbError::connection(format!("TLS error: {}", tls_err)),
            sqlx::Error::Protocol(msg) => DbError::connection(format!("Protocol error: {}", msg)),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::schema(format!("Type not found: {}", type_name), type_name)
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::schema(format!("Column not found: {}", col), col)
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection("Database worker crashed"),
            other => DbError::internal(format!("Unknown database error: {}", other)),
        }
    }
}

impl From<crate::config::ConfigError> for DbError {
    fn from(err: crate::config::ConfigError) -> Self {
        DbError::configuration(err.to_string())
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Structured, serializable view of an error for the API layer and reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl From<&DbError> for ErrorPayload {
    fn from(err: &DbError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            cause: err.cause(),
        }
    }
}

impl From<DbError> for ErrorPayload {
    fn from(err: DbError) -> Self {
        Self::from(&err)
    }
}
