//! Column introspection.
//!
//! Reads a table's column list from the backend catalog so the comparison
//! engine can check that both backends agree on shape and types.

use crate::db::Database;
use crate::db::dialect::validate_identifier;
use crate::error::{DbError, DbResult};
use crate::models::{Backend, ColumnDefinition, DatabaseType, Row, SqlValue};
use serde_json::Value as JsonValue;

/// List the columns of `table` on `backend` in ordinal order.
///
/// Fails with a `Schema` error when the table does not exist.
pub async fn list_columns(
    db: &Database,
    backend: Backend,
    table: &str,
) -> DbResult<Vec<ColumnDefinition>> {
    validate_identifier(table)?;
    let sql = match db.db_type(backend) {
        DatabaseType::PostgreSQL => {
            r#"
            SELECT column_name::text AS name,
                   data_type::text AS data_type,
                   is_nullable::text AS nullable
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#
        }
        DatabaseType::MySQL => {
            r#"
            SELECT CONVERT(COLUMN_NAME USING utf8) AS name,
                   CONVERT(COLUMN_TYPE USING utf8) AS data_type,
                   CONVERT(IS_NULLABLE USING utf8) AS nullable
            FROM information_schema.columns
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
            "#
        }
        DatabaseType::SQLite => {
            r#"
            SELECT name, type AS data_type, "notnull" = 0 AS nullable
            FROM pragma_table_info(?)
            ORDER BY cid
            "#
        }
    };

    let rows = db
        .query(sql, &[SqlValue::from(table)], Some(backend))
        .await?;
    if rows.is_empty() {
        return Err(DbError::schema(
            format!("table not found on backend {}", backend),
            table,
        ));
    }
    rows.iter().map(column_from_row).collect()
}

fn column_from_row(row: &Row) -> DbResult<ColumnDefinition> {
    let text = |key: &str| row.get(key).and_then(JsonValue::as_str).map(str::to_string);
    let name = text("name").ok_or_else(|| DbError::internal("catalog row without column name"))?;
    let data_type = text("data_type").unwrap_or_default();
    let nullable = row.get("nullable").is_some_and(is_truthy);
    Ok(ColumnDefinition::new(name, data_type, nullable))
}

/// Catalogs report nullability as `YES`/`NO`, booleans, or 0/1.
fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_i64().is_some_and(|i| i != 0),
        JsonValue::String(s) => matches!(s.to_ascii_uppercase().as_str(), "YES" | "TRUE" | "1"),
        _ => false,
    }
}
