//! Schema-related data models.
//!
//! Native column types differ per backend; [`CanonicalType`] is the neutral
//! vocabulary used when comparing them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    /// Native type as reported by the backend
    pub data_type: String,
    pub nullable: bool,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
        }
    }
}

/// Backend-neutral column type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalType {
    String,
    Integer,
    Decimal,
    Float,
    Boolean,
    Timestamp,
    Date,
    Time,
    Binary,
    Json,
    Uuid,
    /// Lower-cased native name that matched no rule
    Unknown(String),
}

impl CanonicalType {
    /// Map a native column type to its canonical type.
    ///
    /// `character varying`, `VARCHAR2(255)` and `text` all become `String`;
    /// `NUMBER(10,0)` becomes `Integer` while `NUMERIC(10,2)` stays `Decimal`;
    /// MySQL's `tinyint(1)` is treated as `Boolean`.
    pub fn from_native(native: &str) -> Self {
        let lower = native.trim().to_lowercase();
        let (base, args) = match lower.find('(') {
            Some(idx) => {
                let args = lower[idx + 1..].trim_end_matches(|c| c == ')' || c == ' ');
                let args = args.split(')').next().unwrap_or_default();
                (lower[..idx].trim().to_string(), Some(args.to_string()))
            }
            None => (lower.clone(), None),
        };
        let base = base
            .trim_end_matches(" unsigned")
            .trim_end_matches(" signed")
            .trim()
            .to_string();

        match base.as_str() {
            "character varying" | "varchar" | "varchar2" | "nvarchar" | "nvarchar2" | "char"
            | "character" | "bpchar" | "nchar" | "text" | "tinytext" | "mediumtext"
            | "longtext" | "clob" | "nclob" | "string" | "citext" | "enum" | "set" | "name" => {
                Self::String
            }
            "tinyint" if args.as_deref() == Some("1") => Self::Boolean,
            "integer" | "int" | "int2" | "int4" | "int8" | "smallint" | "bigint" | "tinyint"
            | "mediumint" | "serial" | "bigserial" | "smallserial" => Self::Integer,
            "number" | "numeric" | "decimal" | "dec" => {
                match args.as_deref().map(numeric_scale) {
                    Some(0) => Self::Integer,
                    _ => Self::Decimal,
                }
            }
            "real" | "float" | "float4" | "float8" | "double" | "double precision"
            | "binary_float" | "binary_double" => Self::Float,
            "boolean" | "bool" | "bit" => Self::Boolean,
            "datetime" | "datetime2" | "timestamptz" | "smalldatetime" => Self::Timestamp,
            b if b.starts_with("timestamp") => Self::Timestamp,
            "date" => Self::Date,
            "time" | "timetz" => Self::Time,
            b if b.starts_with("time ") => Self::Time,
            "bytea" | "blob" | "binary" | "varbinary" | "tinyblob" | "mediumblob" | "longblob"
            | "raw" | "long raw" | "image" => Self::Binary,
            "json" | "jsonb" => Self::Json,
            "uuid" | "uniqueidentifier" => Self::Uuid,
            // SQLite type affinity rules
            b if b.contains("int") => Self::Integer,
            b if b.contains("char") || b.contains("clob") || b.contains("text") => Self::String,
            b if b.contains("real") || b.contains("floa") || b.contains("doub") => Self::Float,
            b if b.contains("blob") => Self::Binary,
            _ => Self::Unknown(lower),
        }
    }
}

/// Scale of a `(precision, scale)` argument list; a lone precision has scale 0.
fn numeric_scale(args: &str) -> u32 {
    let mut parts = args.split(',').map(str::trim);
    let _precision = parts.next();
    parts
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

impl std::fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(native) => write!(f, "unknown({})", native),
            other => {
                let name = serde_json::to_value(other)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default();
                f.write_str(&name)
            }
        }
    }
}
