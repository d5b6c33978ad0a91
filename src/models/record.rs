//! Record, table and search models used by repositories and the synchronizer.
//!
//! Managed tables share a fixed set of audit columns (see [`AUDIT_COLUMNS`]).
//! Audit timestamps are stored as fixed-width UTC text produced by
//! [`format_timestamp`], so string comparison on any backend orders them the
//! same way as the instants they encode.

use crate::error::{DbError, DbResult};
use crate::models::query::{Row, value_as_i64, value_as_id};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const ID_COLUMN: &str = "id";
pub const CREATED_AT_COLUMN: &str = "created_at";
pub const UPDATED_AT_COLUMN: &str = "updated_at";
pub const UPDATED_BY_COLUMN: &str = "updated_by";
pub const VERSION_COLUMN: &str = "version";
pub const DELETED_AT_COLUMN: &str = "deleted_at";

/// Columns maintained by the repository, never set directly by callers.
pub const AUDIT_COLUMNS: [&str; 6] = [
    ID_COLUMN,
    CREATED_AT_COLUMN,
    UPDATED_AT_COLUMN,
    UPDATED_BY_COLUMN,
    VERSION_COLUMN,
    DELETED_AT_COLUMN,
];

/// Storage format for audit timestamps (microsecond precision, UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Format a timestamp in the storage format.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Drop sub-microsecond precision so a value survives a storage round trip.
pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = ts.nanosecond() / 1_000 * 1_000;
    ts.with_nanosecond(nanos).unwrap_or(ts)
}

/// Parse a timestamp written by any backend.
///
/// Accepts RFC 3339, the MySQL/PostgreSQL text forms (`2024-01-02 10:00:00`),
/// bare dates, and bare times of day (anchored to 1970-01-01).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(ts) = DateTime::parse_from_str(s, fmt) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    }
    if let Ok(time) = NaiveTime::parse_from_str(s, "%H:%M:%S%.f") {
        return NaiveDate::from_ymd_opt(1970, 1, 1)
            .map(|d| Utc.from_utc_datetime(&d.and_time(time)));
    }
    None
}

/// Interpret a decoded column as a timestamp (text or epoch milliseconds).
pub fn timestamp_of(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => parse_timestamp(s),
        JsonValue::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// Latest of `updated_at` / `created_at` on a row.
pub fn row_modified_at(row: &Row) -> Option<DateTime<Utc>> {
    let updated = row.get(UPDATED_AT_COLUMN).and_then(timestamp_of);
    let created = row.get(CREATED_AT_COLUMN).and_then(timestamp_of);
    match (updated, created) {
        (Some(u), Some(c)) => Some(u.max(c)),
        (u, c) => u.or(c),
    }
}

/// Whether a row carries a soft-delete marker.
pub fn row_is_deleted(row: &Row) -> bool {
    row.get(DELETED_AT_COLUMN).is_some_and(|v| !v.is_null())
}

/// Generic managed entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// Non-audit columns
    pub fields: Row,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Option<String>,
    /// Incremented on every successful update
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Split a decoded row into audit columns and data fields.
    pub fn from_row(mut row: Row) -> DbResult<Self> {
        let id = row
            .remove(ID_COLUMN)
            .as_ref()
            .and_then(value_as_id)
            .ok_or_else(|| DbError::invalid_field(ID_COLUMN, "row has no usable id"))?;
        let created_at = take_timestamp(&mut row, CREATED_AT_COLUMN, &id)?;
        let updated_at = take_timestamp(&mut row, UPDATED_AT_COLUMN, &id)?;
        let version = row
            .remove(VERSION_COLUMN)
            .as_ref()
            .and_then(value_as_i64)
            .ok_or_else(|| {
                DbError::invalid_field(VERSION_COLUMN, format!("record '{}' has no version", id))
            })?;
        let updated_by = match row.remove(UPDATED_BY_COLUMN) {
            Some(JsonValue::String(s)) => Some(s),
            _ => None,
        };
        let deleted_at = row.remove(DELETED_AT_COLUMN).as_ref().and_then(timestamp_of);

        Ok(Self {
            id,
            fields: row,
            created_at,
            updated_at,
            updated_by,
            version,
            deleted_at,
        })
    }

    /// Flatten back into a storable row.
    pub fn to_row(&self) -> Row {
        let mut row = self.fields.clone();
        row.insert(ID_COLUMN.into(), JsonValue::String(self.id.clone()));
        row.insert(
            CREATED_AT_COLUMN.into(),
            JsonValue::String(format_timestamp(&self.created_at)),
        );
        row.insert(
            UPDATED_AT_COLUMN.into(),
            JsonValue::String(format_timestamp(&self.updated_at)),
        );
        row.insert(
            UPDATED_BY_COLUMN.into(),
            self.updated_by
                .clone()
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null),
        );
        row.insert(VERSION_COLUMN.into(), JsonValue::from(self.version));
        row.insert(
            DELETED_AT_COLUMN.into(),
            self.deleted_at
                .map(|ts| JsonValue::String(format_timestamp(&ts)))
                .unwrap_or(JsonValue::Null),
        );
        row
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

fn take_timestamp(row: &mut Row, column: &str, id: &str) -> DbResult<DateTime<Utc>> {
    row.remove(column)
        .as_ref()
        .and_then(timestamp_of)
        .ok_or_else(|| {
            DbError::invalid_field(column, format!("record '{}' has no valid {}", id, column))
        })
}

/// Declared data field of a managed table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub required: bool,
}

/// Managed table declaration: name plus its data fields.
///
/// A table with no declared fields accepts any well-formed column name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn required(mut self, field: impl Into<String>) -> Self {
        self.fields.push(FieldSpec {
            name: field.into(),
            required: true,
        });
        self
    }

    pub fn optional(mut self, field: impl Into<String>) -> Self {
        self.fields.push(FieldSpec {
            name: field.into(),
            required: false,
        });
        self
    }

    /// Whether `column` may be read or written through a repository.
    pub fn knows(&self, column: &str) -> bool {
        self.fields.is_empty()
            || AUDIT_COLUMNS.contains(&column)
            || self.fields.iter().any(|f| f.name == column)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

/// 1-based page number and page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Pagination {
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

/// Filters, sort and pagination for `find_many`.
///
/// Filter values: `null` matches `IS NULL`, an array matches `IN (...)`,
/// anything else matches by equality.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    #[serde(default)]
    pub filters: Row,
    #[serde(default)]
    pub sort: Option<Sort>,
    #[serde(default)]
    pub pagination: Pagination,
    #[serde(default)]
    pub include_deleted: bool,
}

impl SearchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort = Some(Sort {
            field: field.into(),
            order,
        });
        self
    }

    pub fn page(mut self, page: u32, limit: u32) -> Self {
        self.pagination = Pagination { page, limit };
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginatedResult<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
}

impl<T> PaginatedResult<T> {
    pub fn new(data: Vec<T>, total: u64, page: u32, limit: u32) -> Self {
        let total_pages = if limit == 0 {
            0
        } else {
            total.div_ceil(u64::from(limit))
        };
        Self {
            data,
            total,
            page,
            limit,
            total_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_total_pages_rounds_up() {
        let page: PaginatedResult<u8> = PaginatedResult::new(vec![], 21, 1, 10);
        assert_eq!(page.total_pages, 3);
        let page: PaginatedResult<u8> = PaginatedResult::new(vec![], 20, 1, 10);
        assert_eq!(page.total_pages, 2);
        let page: PaginatedResult<u8> = PaginatedResult::new(vec![], 0, 1, 10);
        assert_eq!(page.total_pages, 0);
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, 5, 0).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-01T09:05:00.000000Z");
        assert_eq!(parse_timestamp("2024-03-01T09:05:00.000000Z"), Some(ts));
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-01-02 10:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02T12:00:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02 10:00:00+00"), Some(expected));
        assert!(parse_timestamp("10:30:00") > parse_timestamp("10:00:00"));
        assert_eq!(parse_timestamp("not a date"), None);
    }

    #[test]
    fn test_truncate_micros() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(truncate_micros(ts).nanosecond(), 123_456_000);
    }

    #[test]
    fn test_record_round_trip_through_row() {
        let row = json!({
            "id": "p-1",
            "name": "Apollo",
            "created_at": "2024-01-01T00:00:00.000000Z",
            "updated_at": "2024-01-02T00:00:00.000000Z",
            "updated_by": "alice",
            "version": 3,
            "deleted_at": null
        });
        let row = row.as_object().unwrap().clone();
        let record = Record::from_row(row.clone()).unwrap();
        assert_eq!(record.id, "p-1");
        assert_eq!(record.version, 3);
        assert_eq!(record.fields.get("name"), Some(&json!("Apollo")));
        assert!(!record.is_deleted());
        assert_eq!(record.to_row(), row);
    }

    #[test]
    fn test_record_requires_id() {
        let row = json!({"name": "x"}).as_object().unwrap().clone();
        assert!(Record::from_row(row).is_err());
    }

    #[test]
    fn test_table_spec_field_knowledge() {
        let open = TableSpec::new("notes");
        assert!(open.knows("anything"));
        let spec = TableSpec::new("projects").required("name").optional("status");
        assert!(spec.knows("name"));
        assert!(spec.knows("updated_at"));
        assert!(!spec.knows("color"));
        assert_eq!(spec.required_fields().collect::<Vec<_>>(), vec!["name"]);
    }

    #[test]
    fn test_row_modified_at_prefers_latest() {
        let row = json!({
            "created_at": "2024-01-01T00:00:00.000000Z",
            "updated_at": "2024-02-01T00:00:00.000000Z"
        });
        let ts = row_modified_at(row.as_object().unwrap()).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_pagination_offset() {
        assert_eq!(Pagination { page: 3, limit: 10 }.offset(), 20);
        assert_eq!(Pagination { page: 0, limit: 10 }.offset(), 0);
    }
}
