//! Record and schema comparison across backends.
//!
//! Values decoded from different backends rarely match byte for byte: SQLite
//! hands back booleans as integers and JSON as text, MySQL and PostgreSQL
//! render timestamps differently. [`values_equal`] compares what the values
//! mean rather than how they were encoded.

use crate::db::Database;
use crate::db::dialect::SqlBuilder;
use crate::db::schema::list_columns;
use crate::error::{DbResult, ErrorPayload};
use crate::models::record::{ID_COLUMN, parse_timestamp};
use crate::models::{Backend, CanonicalType, ColumnDefinition, Row, value_as_id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// One field that differs; `None` means the field is absent on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDifference {
    pub field: String,
    pub a_value: Option<JsonValue>,
    pub b_value: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordComparison {
    pub is_identical: bool,
    pub differences: Vec<FieldDifference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaDifferenceKind {
    TypeMismatch,
    MissingInA,
    MissingInB,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDifference {
    pub column: String,
    pub kind: SchemaDifferenceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_a: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_b: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_a: Option<CanonicalType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_b: Option<CanonicalType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaComparison {
    pub table: String,
    pub is_compatible: bool,
    pub columns_a: usize,
    pub columns_b: usize,
    pub differences: Vec<SchemaDifference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordStats {
    pub total_a: u64,
    pub total_b: u64,
    pub identical: u64,
    pub different: u64,
    pub missing_in_a: u64,
    pub missing_in_b: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableComparison {
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaComparison>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<RecordStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ComparisonSummary {
    pub compatible_schemas: usize,
    pub incompatible_schemas: usize,
    pub tables_in_sync: usize,
    pub tables_with_differences: usize,
    pub errored: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub generated_at: DateTime<Utc>,
    pub tables_compared: usize,
    pub tables: Vec<TableComparison>,
    pub summary: ComparisonSummary,
    pub recommendations: Vec<String>,
}

/// Field-by-field diff of two rows. Fields are reported in name order.
pub fn compare_records(a: &Row, b: &Row) -> RecordComparison {
    let fields: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    let differences: Vec<FieldDifference> = fields
        .into_iter()
        .filter_map(|field| {
            let av = a.get(field);
            let bv = b.get(field);
            let same = match (av, bv) {
                (Some(x), Some(y)) => values_equal(x, y),
                _ => false,
            };
            (!same).then(|| FieldDifference {
                field: field.clone(),
                a_value: av.cloned(),
                b_value: bv.cloned(),
            })
        })
        .collect();
    RecordComparison {
        is_identical: differences.is_empty(),
        differences,
    }
}

/// Semantic equality of two decoded column values.
pub fn values_equal(a: &JsonValue, b: &JsonValue) -> bool {
    use JsonValue::*;
    match (a, b) {
        (Null, Null) => true,
        (Null, _) | (_, Null) => false,
        (Number(x), Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Bool(x), Bool(y)) => x == y,
        (Bool(flag), Number(n)) | (Number(n), Bool(flag)) => {
            n.as_f64() == Some(f64::from(u8::from(*flag)))
        }
        (Bool(flag), String(s)) | (String(s), Bool(flag)) => parse_bool(s) == Some(*flag),
        (Number(n), String(s)) | (String(s), Number(n)) => {
            s.trim().parse::<f64>().ok() == n.as_f64()
        }
        (String(x), String(y)) => {
            x == y
                || matches!(
                    (parse_timestamp(x), parse_timestamp(y)),
                    (Some(tx), Some(ty)) if tx == ty
                )
        }
        (String(s), other @ (Object(_) | Array(_)))
        | (other @ (Object(_) | Array(_)), String(s)) => {
            serde_json::from_str::<JsonValue>(s).is_ok_and(|parsed| &parsed == other)
        }
        _ => a == b,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" => Some(true),
        "false" | "f" | "0" => Some(false),
        _ => None,
    }
}

/// Compare two column lists by canonical type.
///
/// Type mismatches on shared columns always break compatibility; columns
/// present on only one side break it only when `strict` is set.
pub fn compare_columns(
    table: &str,
    columns_a: &[ColumnDefinition],
    columns_b: &[ColumnDefinition],
    strict: bool,
) -> SchemaComparison {
    let key = |c: &ColumnDefinition| c.name.to_lowercase();
    let by_name_b: BTreeMap<String, &ColumnDefinition> =
        columns_b.iter().map(|c| (key(c), c)).collect();
    let names_a: BTreeSet<String> = columns_a.iter().map(key).collect();

    let mut differences = Vec::new();
    let mut type_mismatch = false;
    for col_a in columns_a {
        match by_name_b.get(&key(col_a)) {
            Some(col_b) => {
                let canonical_a = CanonicalType::from_native(&col_a.data_type);
                let canonical_b = CanonicalType::from_native(&col_b.data_type);
                if canonical_a != canonical_b {
                    type_mismatch = true;
                    differences.push(SchemaDifference {
                        column: col_a.name.clone(),
                        kind: SchemaDifferenceKind::TypeMismatch,
                        type_a: Some(col_a.data_type.clone()),
                        type_b: Some(col_b.data_type.clone()),
                        canonical_a: Some(canonical_a),
                        canonical_b: Some(canonical_b),
                    });
                }
            }
            None => differences.push(SchemaDifference {
                column: col_a.name.clone(),
                kind: SchemaDifferenceKind::MissingInB,
                type_a: Some(col_a.data_type.clone()),
                type_b: None,
                canonical_a: Some(CanonicalType::from_native(&col_a.data_type)),
                canonical_b: None,
            }),
        }
    }
    for col_b in columns_b.iter().filter(|c| !names_a.contains(&key(c))) {
        differences.push(SchemaDifference {
            column: col_b.name.clone(),
            kind: SchemaDifferenceKind::MissingInA,
            type_a: None,
            type_b: Some(col_b.data_type.clone()),
            canonical_a: None,
            canonical_b: Some(CanonicalType::from_native(&col_b.data_type)),
        });
    }

    let missing_columns = differences
        .iter()
        .any(|d| d.kind != SchemaDifferenceKind::TypeMismatch);
    SchemaComparison {
        table: table.to_string(),
        is_compatible: !type_mismatch && !(strict && missing_columns),
        columns_a: columns_a.len(),
        columns_b: columns_b.len(),
        differences,
    }
}

/// Compares schemas and records of managed tables across both backends.
#[derive(Debug, Clone)]
pub struct DataComparisonEngine {
    db: Database,
    strict_schema: bool,
}

impl DataComparisonEngine {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            strict_schema: false,
        }
    }

    /// Treat extra or missing columns as incompatible.
    pub fn with_strict_schema(mut self, strict: bool) -> Self {
        self.strict_schema = strict;
        self
    }

    pub fn compare_records(&self, a: &Row, b: &Row) -> RecordComparison {
        compare_records(a, b)
    }

    pub async fn compare_table_schemas(&self, table: &str) -> DbResult<SchemaComparison> {
        self.db.table_spec(table)?;
        let (columns_a, columns_b) = futures_util::try_join!(
            list_columns(&self.db, Backend::A, table),
            list_columns(&self.db, Backend::B, table)
        )?;
        Ok(compare_columns(
            table,
            &columns_a,
            &columns_b,
            self.strict_schema,
        ))
    }

    async fn rows_by_id(&self, backend: Backend, table: &str) -> DbResult<BTreeMap<String, Row>> {
        let mut b = SqlBuilder::new(self.db.db_type(backend));
        b.push("SELECT * FROM ").push_ident(table);
        let (sql, params) = b.finish()?;
        let rows = self.db.query(&sql, &params, Some(backend)).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.get(ID_COLUMN).and_then(value_as_id)?;
                Some((id, row))
            })
            .collect())
    }

    /// Record-level statistics for one table.
    pub async fn compare_table_records(&self, table: &str) -> DbResult<RecordStats> {
        self.db.table_spec(table)?;
        let (rows_a, rows_b) = futures_util::try_join!(
            self.rows_by_id(Backend::A, table),
            self.rows_by_id(Backend::B, table)
        )?;

        let mut stats = RecordStats {
            total_a: rows_a.len() as u64,
            total_b: rows_b.len() as u64,
            ..Default::default()
        };
        for (id, row_a) in &rows_a {
            match rows_b.get(id) {
                Some(row_b) if compare_records(row_a, row_b).is_identical => stats.identical += 1,
                Some(_) => stats.different += 1,
                None => stats.missing_in_b += 1,
            }
        }
        stats.missing_in_a = rows_b.keys().filter(|id| !rows_a.contains_key(*id)).count() as u64;
        Ok(stats)
    }

    async fn compare_table(&self, table: &str) -> TableComparison {
        let schema = self.compare_table_schemas(table).await;
        let records = match &schema {
            Ok(_) => Some(self.compare_table_records(table).await),
            Err(_) => None,
        };
        let error = match (&schema, &records) {
            (Err(e), _) | (_, Some(Err(e))) => {
                warn!(table = %table, error = %e, "Table comparison failed");
                Some(ErrorPayload::from(e))
            }
            _ => None,
        };
        TableComparison {
            table: table.to_string(),
            schema: schema.ok(),
            records: records.and_then(Result::ok),
            error,
        }
    }

    /// Compare schemas and records of every listed table.
    ///
    /// A table that fails is reported with `error` set; the others still run.
    pub async fn generate_comparison_report(&self, tables: &[String]) -> ComparisonReport {
        let mut results = Vec::with_capacity(tables.len());
        for table in tables {
            results.push(self.compare_table(table).await);
        }

        let mut summary = ComparisonSummary::default();
        let mut recommendations = Vec::new();
        for result in &results {
            if let Some(error) = &result.error {
                summary.errored += 1;
                recommendations.push(format!(
                    "Table '{}': comparison failed ({}); check connectivity and that the table exists on both backends",
                    result.table, error.message
                ));
            }
            if let Some(schema) = &result.schema {
                if schema.is_compatible {
                    summary.compatible_schemas += 1;
                } else {
                    summary.incompatible_schemas += 1;
                }
                recommend_for_schema(schema, &mut recommendations);
            }
            if let Some(stats) = &result.records {
                if stats.different == 0 && stats.missing_in_a == 0 && stats.missing_in_b == 0 {
                    summary.tables_in_sync += 1;
                } else {
                    summary.tables_with_differences += 1;
                }
                recommend_for_records(&result.table, stats, &mut recommendations);
            }
        }
        if recommendations.is_empty() {
            recommendations.push("All compared tables match; no action needed".to_string());
        }

        info!(
            tables = results.len(),
            with_differences = summary.tables_with_differences,
            errored = summary.errored,
            "Comparison report generated"
        );
        ComparisonReport {
            generated_at: self.db.clock().now(),
            tables_compared: results.len(),
            tables: results,
            summary,
            recommendations,
        }
    }
}

fn recommend_for_schema(schema: &SchemaComparison, out: &mut Vec<String>) {
    let columns = |kind: SchemaDifferenceKind| -> Vec<&str> {
        schema
            .differences
            .iter()
            .filter(|d| d.kind == kind)
            .map(|d| d.column.as_str())
            .collect()
    };
    let mismatched = columns(SchemaDifferenceKind::TypeMismatch);
    if !mismatched.is_empty() {
        out.push(format!(
            "Table '{}': align column types ({}) before synchronizing",
            schema.table,
            mismatched.join(", ")
        ));
    }
    for (kind, backend) in [
        (SchemaDifferenceKind::MissingInA, Backend::A),
        (SchemaDifferenceKind::MissingInB, Backend::B),
    ] {
        let missing = columns(kind);
        if !missing.is_empty() {
            out.push(format!(
                "Table '{}': columns missing on backend {}: {}",
                schema.table,
                backend,
                missing.join(", ")
            ));
        }
    }
}

fn recommend_for_records(table: &str, stats: &RecordStats, out: &mut Vec<String>) {
    if stats.missing_in_b > 0 {
        out.push(format!(
            "Table '{}': {} records missing on backend B; run an A_to_B or bidirectional sync",
            table, stats.missing_in_b
        ));
    }
    if stats.missing_in_a > 0 {
        out.push(format!(
            "Table '{}': {} records missing on backend A; run a B_to_A or bidirectional sync",
            table, stats.missing_in_a
        ));
    }
    if stats.different > 0 {
        out.push(format!(
            "Table '{}': {} records differ; run a bidirectional sync to reconcile",
            table, stats.different
        ));
    }
}
