//! Database dispatch macros for reducing code duplication.
//!
//! This module provides declarative macros that generate database-specific
//! implementations while maintaining linear readability. The macros expand
//! at compile time with zero runtime overhead.

/// Macro for generating database dispatch match arms.
///
/// Works for any of the per-backend enums in `db::pool` (`DbPool`,
/// `DbConnection`), reducing the need to manually write repetitive match
/// statements.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(DbConnection, conn, {
///     MySql(c) => mysql::fetch_rows(c, sql, params, timeout).await,
///     Postgres(c) => postgres::fetch_rows(c, sql, params, timeout).await,
///     SQLite(c) => sqlite::fetch_rows(c, sql, params, timeout).await,
/// })
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($enum:ident, $value:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $value {
            $(
                $crate::db::pool::$enum::$variant($p) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
