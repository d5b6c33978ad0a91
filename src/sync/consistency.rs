//! Row-count and key-set consistency checks between the two backends.

use crate::db::Database;
use crate::db::dialect::SqlBuilder;
use crate::error::{DbResult, ErrorPayload};
use crate::models::record::ID_COLUMN;
use crate::models::{
    Backend, ConsistencyReport, ConsistencySummary, Discrepancy, DiscrepancyKind, MissingRecords,
    ValidationReport, value_as_i64, value_as_id,
};
use futures_util::future::join_all;
use std::collections::BTreeSet;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ConsistencyChecker {
    db: Database,
    tables: Vec<String>,
}

impl ConsistencyChecker {
    /// Checker over every table registered with `db`.
    pub fn new(db: Database) -> Self {
        let tables = db.tables().into_iter().map(|spec| spec.name).collect();
        Self { db, tables }
    }

    /// Override the tables `validate_all_tables` covers.
    pub fn with_tables(mut self, tables: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    async fn count(&self, backend: Backend, table: &str) -> DbResult<u64> {
        let mut b = SqlBuilder::new(self.db.db_type(backend));
        b.push("SELECT COUNT(*) AS total FROM ").push_ident(table);
        let (sql, params) = b.finish()?;
        let rows = self.db.query(&sql, &params, Some(backend)).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("total"))
            .and_then(value_as_i64)
            .unwrap_or(0)
            .max(0) as u64)
    }

    async fn ids(&self, backend: Backend, table: &str) -> DbResult<BTreeSet<String>> {
        let mut b = SqlBuilder::new(self.db.db_type(backend));
        b.push("SELECT ")
            .push_ident(ID_COLUMN)
            .push(" FROM ")
            .push_ident(table);
        let (sql, params) = b.finish()?;
        let rows = self.db.query(&sql, &params, Some(backend)).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get(ID_COLUMN).and_then(value_as_id))
            .collect())
    }

    /// Ids present on one backend only, each list sorted ascending.
    pub async fn find_missing_records(&self, table: &str) -> DbResult<MissingRecords> {
        self.db.table_spec(table)?;
        let (ids_a, ids_b) = futures_util::try_join!(
            self.ids(Backend::A, table),
            self.ids(Backend::B, table)
        )?;
        Ok(MissingRecords {
            missing_in_a: ids_b.difference(&ids_a).cloned().collect(),
            missing_in_b: ids_a.difference(&ids_b).cloned().collect(),
        })
    }

    /// Compare row counts; on a mismatch, list the ids missing on each side.
    pub async fn check_table_consistency(&self, table: &str) -> DbResult<ConsistencyReport> {
        self.db.table_spec(table)?;
        let (count_a, count_b) = futures_util::try_join!(
            self.count(Backend::A, table),
            self.count(Backend::B, table)
        )?;

        let is_consistent = count_a == count_b;
        let discrepancies = if is_consistent {
            Vec::new()
        } else {
            let missing = self.find_missing_records(table).await?;
            missing
                .missing_in_a
                .into_iter()
                .map(|record_id| Discrepancy {
                    record_id,
                    kind: DiscrepancyKind::MissingInA,
                })
                .chain(missing.missing_in_b.into_iter().map(|record_id| Discrepancy {
                    record_id,
                    kind: DiscrepancyKind::MissingInB,
                }))
                .collect()
        };

        if !is_consistent {
            warn!(
                table = %table,
                count_a,
                count_b,
                discrepancies = discrepancies.len(),
                "Table is inconsistent"
            );
        }
        Ok(ConsistencyReport {
            table_name: table.to_string(),
            is_consistent,
            count_a,
            count_b,
            discrepancies,
            error: None,
        })
    }

    /// Check every configured table. A table whose check fails is reported
    /// as inconsistent with its error attached.
    pub async fn validate_all_tables(&self) -> ValidationReport {
        let table_results: Vec<ConsistencyReport> =
            join_all(self.tables.iter().map(|table| async move {
                match self.check_table_consistency(table).await {
                    Ok(report) => report,
                    Err(e) => {
                        warn!(table = %table, error = %e, "Consistency check failed");
                        ConsistencyReport {
                            table_name: table.clone(),
                            is_consistent: false,
                            count_a: 0,
                            count_b: 0,
                            discrepancies: Vec::new(),
                            error: Some(ErrorPayload::from(e)),
                        }
                    }
                }
            }))
            .await;

        let errored = table_results.iter().filter(|r| r.error.is_some()).count();
        let consistent = table_results.iter().filter(|r| r.is_consistent).count();
        let summary = ConsistencySummary {
            total_tables: table_results.len(),
            consistent,
            inconsistent: table_results.len() - consistent,
            errored,
        };
        info!(
            tables = summary.total_tables,
            inconsistent = summary.inconsistent,
            errored = summary.errored,
            "Consistency validation finished"
        );

        ValidationReport {
            overall_consistency: summary.inconsistent == 0,
            table_results,
            summary,
            checked_at: self.db.clock().now(),
        }
    }
}
