//! Generic CRUD over a managed table, bound to a unit of work.
//!
//! Every statement runs on the owning transaction's connection. Column names
//! are checked against the table's [`TableSpec`] and the identifier rules
//! before they reach SQL text.

use crate::db::dialect::SqlBuilder;
use crate::db::unit_of_work::UnitOfWork;
use crate::error::{DbError, DbResult};
use crate::models::record::{
    CREATED_AT_COLUMN, DELETED_AT_COLUMN, ID_COLUMN, UPDATED_AT_COLUMN, UPDATED_BY_COLUMN,
    VERSION_COLUMN, format_timestamp, truncate_micros,
};
use crate::models::{
    AUDIT_COLUMNS, MAX_PAGE_LIMIT, PaginatedResult, Record, Row, SearchCriteria, SqlValue,
    TableSpec, value_as_i64,
};
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

pub struct Repository<'u> {
    uow: &'u mut UnitOfWork,
    spec: TableSpec,
    actor: Option<String>,
}

impl std::fmt::Debug for Repository<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("table", &self.spec.name)
            .field("uow", &self.uow.id())
            .field("actor", &self.actor)
            .finish()
    }
}

impl<'u> Repository<'u> {
    pub(crate) fn new(uow: &'u mut UnitOfWork, spec: TableSpec) -> Self {
        Self {
            uow,
            spec,
            actor: None,
        }
    }

    /// Record `actor` as `updated_by` on writes.
    pub fn acting_as(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn table(&self) -> &str {
        &self.spec.name
    }

    fn builder(&self) -> SqlBuilder {
        SqlBuilder::new(self.uow.db_type())
    }

    fn now(&self) -> String {
        format_timestamp(&truncate_micros(self.uow.database().clock().now()))
    }

    fn check_field(&self, field: &str) -> DbResult<()> {
        if self.spec.knows(field) {
            Ok(())
        } else {
            Err(DbError::invalid_field(
                field,
                format!("unknown field '{}' for table '{}'", field, self.spec.name),
            ))
        }
    }

    /// Data fields a caller may write: known, and not an audit column.
    fn check_writable(&self, data: &Row) -> DbResult<()> {
        for field in data.keys() {
            if AUDIT_COLUMNS.contains(&field.as_str()) {
                return Err(DbError::invalid_field(
                    field.as_str(),
                    format!("'{}' is maintained by the repository", field),
                ));
            }
            self.check_field(field)?;
        }
        Ok(())
    }

    async fn select_one(&mut self, id: &str, include_deleted: bool) -> DbResult<Option<Record>> {
        let mut b = self.builder();
        b.push("SELECT * FROM ")
            .push_ident(&self.spec.name)
            .push(" WHERE ")
            .push_ident(ID_COLUMN)
            .push(" = ")
            .push_bind(id);
        if !include_deleted {
            b.push(" AND ").push_ident(DELETED_AT_COLUMN).push(" IS NULL");
        }
        let (sql, params) = b.finish()?;
        let rows = self.uow.query(&sql, &params).await?;
        rows.into_iter().next().map(Record::from_row).transpose()
    }

    /// Live record by id.
    pub async fn find_by_id(&mut self, id: &str) -> DbResult<Option<Record>> {
        self.select_one(id, false).await
    }

    /// Record by id, soft-deleted or not.
    pub async fn find_by_id_including_deleted(&mut self, id: &str) -> DbResult<Option<Record>> {
        self.select_one(id, true).await
    }

    fn push_where(&self, b: &mut SqlBuilder, criteria: &SearchCriteria) -> DbResult<()> {
        b.push(" WHERE 1 = 1");
        if !criteria.include_deleted {
            b.push(" AND ").push_ident(DELETED_AT_COLUMN).push(" IS NULL");
        }
        for (field, value) in &criteria.filters {
            self.check_field(field)?;
            b.push(" AND ").push_ident(field);
            match value {
                JsonValue::Null => {
                    b.push(" IS NULL");
                }
                JsonValue::Array(items) => {
                    b.push(" IN ")
                        .push_bind_list(items.iter().map(SqlValue::from_json));
                }
                other => {
                    b.push(" = ").push_bind(SqlValue::from_json(other));
                }
            }
        }
        Ok(())
    }

    /// Filter, sort and page. Results are ordered by the sort field, then id.
    pub async fn find_many(
        &mut self,
        criteria: &SearchCriteria,
    ) -> DbResult<PaginatedResult<Record>> {
        let page = criteria.pagination;
        if page.limit == 0 || page.limit > MAX_PAGE_LIMIT {
            return Err(DbError::invalid_field(
                "limit",
                format!("limit must be between 1 and {}", MAX_PAGE_LIMIT),
            ));
        }
        if page.page == 0 {
            return Err(DbError::invalid_field("page", "page numbers start at 1"));
        }
        if let Some(sort) = &criteria.sort {
            self.check_field(&sort.field)?;
        }

        let mut count = self.builder();
        count.push("SELECT COUNT(*) AS total FROM ").push_ident(&self.spec.name);
        self.push_where(&mut count, criteria)?;
        let (count_sql, count_params) = count.finish()?;
        let total = self
            .uow
            .query(&count_sql, &count_params)
            .await?
            .first()
            .and_then(|row| row.get("total"))
            .and_then(value_as_i64)
            .unwrap_or(0)
            .max(0) as u64;

        let mut select = self.builder();
        select.push("SELECT * FROM ").push_ident(&self.spec.name);
        self.push_where(&mut select, criteria)?;
        select.push(" ORDER BY ");
        if let Some(sort) = &criteria.sort {
            select
                .push_ident(&sort.field)
                .push(" ")
                .push(sort.order.as_sql())
                .push(", ");
        }
        select.push_ident(ID_COLUMN).push(" ASC");
        select.push_limit_offset(u64::from(page.limit), page.offset());
        let (sql, params) = select.finish()?;

        let data = self
            .uow
            .query(&sql, &params)
            .await?
            .into_iter()
            .map(Record::from_row)
            .collect::<DbResult<Vec<_>>>()?;

        Ok(PaginatedResult::new(data, total, page.page, page.limit))
    }

    /// Insert a new record with a fresh id, `version = 1` and audit timestamps.
    pub async fn create(&mut self, data: Row) -> DbResult<Record> {
        self.check_writable(&data)?;
        for field in self.spec.required_fields() {
            if data.get(field).is_none_or(JsonValue::is_null) {
                return Err(DbError::invalid_field(field, format!("'{}' is required", field)));
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = self.now();
        let mut b = self.builder();
        b.push("INSERT INTO ").push_ident(&self.spec.name).push(" (");
        b.push_idents(data.keys().map(String::as_str));
        if !data.is_empty() {
            b.push(", ");
        }
        b.push_idents([
            ID_COLUMN,
            CREATED_AT_COLUMN,
            UPDATED_AT_COLUMN,
            UPDATED_BY_COLUMN,
            VERSION_COLUMN,
        ]);
        b.push(") VALUES (");
        for value in data.values() {
            b.push_bind(SqlValue::from_json(value)).push(", ");
        }
        b.push_bind(id.as_str())
            .push(", ")
            .push_bind(now.as_str())
            .push(", ")
            .push_bind(now.as_str())
            .push(", ")
            .push_bind(self.actor.clone().map_or(SqlValue::Null, SqlValue::Text))
            .push(", ")
            .push_bind(1i64)
            .push(")");
        let (sql, params) = b.finish()?;
        self.uow.execute(&sql, &params).await?;
        debug!(table = %self.spec.name, id = %id, "Record created");

        self.find_by_id(&id)
            .await?
            .ok_or_else(|| DbError::internal(format!("record '{}' vanished after insert", id)))
    }

    /// Apply `patch` if the record is still at `expected_version`.
    ///
    /// A version mismatch is a `Conflict` error; the transaction stays usable.
    pub async fn update(
        &mut self,
        id: &str,
        expected_version: i64,
        patch: Row,
    ) -> DbResult<Record> {
        self.check_writable(&patch)?;
        for field in self.spec.required_fields() {
            if patch.get(field).is_some_and(JsonValue::is_null) {
                return Err(DbError::invalid_field(field, format!("'{}' is required", field)));
            }
        }

        let current = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| DbError::not_found(self.spec.name.clone(), id))?;
        if current.version != expected_version {
            return Err(DbError::version_conflict(
                id,
                expected_version,
                Some(current.version),
            ));
        }

        let now = self.now();
        let mut b = self.builder();
        b.push("UPDATE ").push_ident(&self.spec.name).push(" SET ");
        for (field, value) in &patch {
            b.push_ident(field)
                .push(" = ")
                .push_bind(SqlValue::from_json(value))
                .push(", ");
        }
        b.push_ident(UPDATED_AT_COLUMN)
            .push(" = ")
            .push_bind(now.as_str())
            .push(", ")
            .push_ident(UPDATED_BY_COLUMN)
            .push(" = ")
            .push_bind(self.actor.clone().map_or(SqlValue::Null, SqlValue::Text))
            .push(", ")
            .push_ident(VERSION_COLUMN)
            .push(" = ")
            .push_ident(VERSION_COLUMN)
            .push(" + 1 WHERE ")
            .push_ident(ID_COLUMN)
            .push(" = ")
            .push_bind(id)
            .push(" AND ")
            .push_ident(VERSION_COLUMN)
            .push(" = ")
            .push_bind(expected_version)
            .push(" AND ")
            .push_ident(DELETED_AT_COLUMN)
            .push(" IS NULL");
        let (sql, params) = b.finish()?;

        if self.uow.execute(&sql, &params).await? == 0 {
            return Err(DbError::version_conflict(id, expected_version, None));
        }
        debug!(table = %self.spec.name, id = %id, version = expected_version + 1, "Record updated");

        self.find_by_id(id)
            .await?
            .ok_or_else(|| DbError::not_found(self.spec.name.clone(), id))
    }

    /// Soft-delete. Returns `false` if there was no live record to delete.
    pub async fn delete(&mut self, id: &str) -> DbResult<bool> {
        let now = self.now();
        let mut b = self.builder();
        b.push("UPDATE ")
            .push_ident(&self.spec.name)
            .push(" SET ")
            .push_ident(DELETED_AT_COLUMN)
            .push(" = ")
            .push_bind(now.as_str())
            .push(", ")
            .push_ident(UPDATED_AT_COLUMN)
            .push(" = ")
            .push_bind(now.as_str())
            .push(", ")
            .push_ident(UPDATED_BY_COLUMN)
            .push(" = ")
            .push_bind(self.actor.clone().map_or(SqlValue::Null, SqlValue::Text))
            .push(", ")
            .push_ident(VERSION_COLUMN)
            .push(" = ")
            .push_ident(VERSION_COLUMN)
            .push(" + 1 WHERE ")
            .push_ident(ID_COLUMN)
            .push(" = ")
            .push_bind(id)
            .push(" AND ")
            .push_ident(DELETED_AT_COLUMN)
            .push(" IS NULL");
        let (sql, params) = b.finish()?;
        let deleted = self.uow.execute(&sql, &params).await? > 0;
        if deleted {
            debug!(table = %self.spec.name, id = %id, "Record soft-deleted");
        }
        Ok(deleted)
    }
}
