//! SQL dialect differences and a small statement builder.
//!
//! Table and column names cannot be bound as parameters, so every identifier
//! that reaches SQL text goes through [`validate_identifier`] first and is then
//! quoted for the target backend.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, SqlValue};

/// PostgreSQL truncates identifiers beyond 63 bytes; use it as the common limit.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// `[A-Za-z_][A-Za-z0-9_]*`, at most [`MAX_IDENTIFIER_LEN`] bytes.
pub fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    s.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn validate_identifier(s: &str) -> DbResult<()> {
    if is_valid_identifier(s) {
        Ok(())
    } else {
        Err(DbError::invalid_field(
            s,
            format!(
                "'{}' is not a valid identifier (letters, digits and underscores, max {} characters)",
                s, MAX_IDENTIFIER_LEN
            ),
        ))
    }
}

/// Quote a validated identifier.
pub fn quote_identifier(db_type: DatabaseType, ident: &str) -> String {
    match db_type {
        DatabaseType::MySQL => format!("`{}`", ident),
        DatabaseType::PostgreSQL | DatabaseType::SQLite => format!("\"{}\"", ident),
    }
}

/// Placeholder for the `n`th (1-based) bound parameter.
pub fn placeholder(db_type: DatabaseType, n: usize) -> String {
    match db_type {
        DatabaseType::PostgreSQL => format!("${}", n),
        DatabaseType::MySQL | DatabaseType::SQLite => "?".to_string(),
    }
}

pub fn begin_statement(db_type: DatabaseType) -> &'static str {
    match db_type {
        DatabaseType::MySQL => "START TRANSACTION",
        DatabaseType::PostgreSQL | DatabaseType::SQLite => "BEGIN",
    }
}

/// Incrementally builds a parameterized statement for one backend.
///
/// Identifier errors are remembered and reported by [`SqlBuilder::finish`], so
/// call sites can chain pushes without checking each one.
#[derive(Debug)]
pub struct SqlBuilder {
    db_type: DatabaseType,
    sql: String,
    params: Vec<SqlValue>,
    error: Option<DbError>,
}

impl SqlBuilder {
    pub fn new(db_type: DatabaseType) -> Self {
        Self {
            db_type,
            sql: String::new(),
            params: Vec::new(),
            error: None,
        }
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    pub fn push_ident(&mut self, ident: &str) -> &mut Self {
        if let Err(e) = validate_identifier(ident) {
            self.error.get_or_insert(e);
        }
        self.sql.push_str(&quote_identifier(self.db_type, ident));
        self
    }

    /// Push a comma-separated list of identifiers.
    pub fn push_idents<'a>(&mut self, idents: impl IntoIterator<Item = &'a str>) -> &mut Self {
        for (i, ident) in idents.into_iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.push_ident(ident);
        }
        self
    }

    /// Bind a value. `NULL` is written inline so it takes the column's type.
    pub fn push_bind(&mut self, value: impl Into<SqlValue>) -> &mut Self {
        let value = value.into();
        if value.is_null() {
            self.sql.push_str("NULL");
            return self;
        }
        self.params.push(value);
        let marker = placeholder(self.db_type, self.params.len());
        self.sql.push_str(&marker);
        self
    }

    /// Push `(v1, v2, ...)`; an empty list becomes `(NULL)`, which matches nothing.
    pub fn push_bind_list(&mut self, values: impl IntoIterator<Item = SqlValue>) -> &mut Self {
        self.sql.push('(');
        let mut empty = true;
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.push_bind(value);
            empty = false;
        }
        if empty {
            self.sql.push_str("NULL");
        }
        self.sql.push(')');
        self
    }

    pub fn push_limit_offset(&mut self, limit: u64, offset: u64) -> &mut Self {
        self.sql
            .push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));
        self
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    pub fn finish(self) -> DbResult<(String, Vec<SqlValue>)> {
        match self.error {
            Some(e) => Err(e),
            None => Ok((self.sql, self.params)),
        }
    }
}
