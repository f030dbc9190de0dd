//! # Query Builder
//!
//! Fluent SQL string assembly with positional arguments.
//!
//! ## How Placeholders Are Numbered
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  .where_("status = ?", [active])      args: [active]          → ?1      │
//! │  .and("email LIKE ?", ["%doe%"])      args: [active, %doe%]   → ?2      │
//! │  .limit(10)                           args: [.., 10]          → ?3      │
//! │  .offset(0)                           args: [.., 10, 0]       → ?4      │
//! │                                                                         │
//! │  Placeholder index == argument count right after the push.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The builder performs no SQL validation. Calling `and` before `where_`
//! produces broken SQL; that is the caller's problem, not a builder error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// SQL Values
// =============================================================================

/// A positional argument bound to a `?N` placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        SqlValue::Text(v.clone())
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// Wraps `needle` for a substring `LIKE` match, escaping `%`, `_` and `\`.
///
/// Pair it with `ESCAPE '\'` in the SQL fragment.
///
/// ```rust
/// use keystone_core::query::contains_pattern;
///
/// assert_eq!(contains_pattern("doe"), "%doe%");
/// assert_eq!(contains_pattern("50%_off"), "%50\\%\\_off%");
/// ```
pub fn contains_pattern(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

// =============================================================================
// Sort Order
// =============================================================================

/// Direction for `ORDER BY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortOrder::Asc => write!(f, "ASC"),
            SortOrder::Desc => write!(f, "DESC"),
        }
    }
}

// =============================================================================
// Query Builder
// =============================================================================

/// Fluent accumulator of SQL fragments and positional arguments.
///
/// ## Example
/// ```rust
/// use keystone_core::query::{QueryBuilder, SortOrder};
///
/// let (sql, args) = QueryBuilder::new()
///     .select("id, email")
///     .from("users")
///     .where_("status = ?", ["active"])
///     .order_by("created_at", SortOrder::Desc)
///     .limit(10)
///     .offset(20)
///     .build();
///
/// assert_eq!(
///     sql,
///     "SELECT id, email FROM users WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
/// );
/// assert_eq!(args.len(), 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    query: String,
    args: Vec<SqlValue>,
    ordered: bool,
}

impl QueryBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a `SELECT`, replacing anything accumulated so far.
    pub fn select(mut self, columns: &str) -> Self {
        self.query = format!("SELECT {columns}");
        self.args.clear();
        self.ordered = false;
        self
    }

    /// Appends ` FROM {table}`.
    pub fn from(mut self, table: &str) -> Self {
        self.query.push_str(" FROM ");
        self.query.push_str(table);
        self
    }

    /// Appends ` WHERE {condition}`, binding `args` to its `?` markers.
    pub fn where_<I, V>(self, condition: &str, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        self.clause("WHERE", condition, args)
    }

    /// Appends ` AND {condition}`, binding `args` to its `?` markers.
    pub fn and<I, V>(self, condition: &str, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        self.clause("AND", condition, args)
    }

    /// Appends ` OR {condition}`, binding `args` to its `?` markers.
    pub fn or<I, V>(self, condition: &str, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        self.clause("OR", condition, args)
    }

    /// Appends ` ORDER BY {column} {order}`; later calls add tie-breakers.
    pub fn order_by(mut self, column: &str, order: SortOrder) -> Self {
        if self.ordered {
            self.query.push_str(&format!(", {column} {order}"));
        } else {
            self.query.push_str(&format!(" ORDER BY {column} {order}"));
            self.ordered = true;
        }
        self
    }

    /// Appends ` LIMIT ?N`.
    pub fn limit(mut self, limit: i64) -> Self {
        let placeholder = self.push_arg(limit);
        self.query.push_str(&format!(" LIMIT {placeholder}"));
        self
    }

    /// Appends ` OFFSET ?N`.
    pub fn offset(mut self, offset: i64) -> Self {
        let placeholder = self.push_arg(offset);
        self.query.push_str(&format!(" OFFSET {placeholder}"));
        self
    }

    /// Returns the assembled SQL and its arguments.
    pub fn build(self) -> (String, Vec<SqlValue>) {
        (self.query, self.args)
    }

    /// The SQL accumulated so far.
    pub fn sql(&self) -> &str {
        &self.query
    }

    /// The arguments accumulated so far.
    pub fn args(&self) -> &[SqlValue] {
        &self.args
    }

    fn clause<I, V>(mut self, keyword: &str, condition: &str, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        let mut values = args.into_iter().map(Into::into);
        let mut fragment = String::with_capacity(condition.len() + 8);
        let mut pending = values.next();

        for c in condition.chars() {
            if c == '?' {
                if let Some(value) = pending.take() {
                    let placeholder = self.push_arg(value);
                    fragment.push_str(&placeholder);
                    pending = values.next();
                    continue;
                }
            }
            fragment.push(c);
        }

        // Surplus arguments (more values than markers) are still bound.
        if let Some(value) = pending {
            self.push_arg(value);
        }
        for value in values {
            self.push_arg(value);
        }

        self.query.push(' ');
        self.query.push_str(keyword);
        self.query.push(' ');
        self.query.push_str(&fragment);
        self
    }

    fn push_arg(&mut self, value: impl Into<SqlValue>) -> String {
        self.args.push(value.into());
        format!("?{}", self.args.len())
    }
}

impl fmt::Display for QueryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.query)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
