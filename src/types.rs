//! # Row Types for sqlite-rw
//!
//! Tables handled by this crate are schema-less at the boundary: a row is an
//! ordered mapping from column name to a tagged scalar. The same
//! representation is used for caller input, for query results, and for the
//! JSON payload stored in the change log, so a row read back from the primary
//! can be replayed on the replica without any schema knowledge.
//!
//! ## Types
//!
//! - [`Value`]: `NULL`, `INTEGER`, `REAL` or `TEXT`
//! - [`Row`]: column name → [`Value`], ordered by column name
//! - [`Filter`]: the `WHERE` clause of a select/update/delete
//! - [`Select`]: filter plus projection, ordering and paging
//!
//! ## Example
//!
//! ```rust
//! use sqlite_rw::{Filter, Row, Value};
//!
//! let row = Row::new().with("name", "a").with("age", 1);
//! assert_eq!(row.get("age"), Some(&Value::Integer(1)));
//!
//! let filter = Filter::eq("name", "a").and("age", 1);
//! # let _ = filter;
//! ```

use std::collections::BTreeMap;
use std::fmt;

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};

use crate::error::{Error, Result};

/// Primary-key column shared by every replicated table.
pub const ID_COLUMN: &str = "id";

// =============================================================================
// Value
// =============================================================================

/// A single column value.
///
/// # Why No Blob?
///
/// Change-log payloads are JSON text. JSON has no byte-string type, so a blob
/// could not survive the trip to the replica unchanged. Reading a blob column
/// through this crate fails with [`Error::UnsupportedValue`] instead of being
/// silently re-encoded.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// SQL `NULL`.
    #[default]
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
}

impl Value {
    /// Returns the integer if this is an `Integer`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the text if this is a `Text`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Converts a SQLite value borrowed from a result row.
    pub fn from_sql_ref(value: ValueRef<'_>) -> Result<Self> {
        match value {
            ValueRef::Null => Ok(Value::Null),
            ValueRef::Integer(i) => Ok(Value::Integer(i)),
            ValueRef::Real(f) => Ok(Value::Real(f)),
            ValueRef::Text(bytes) => std::str::from_utf8(bytes)
                .map(|s| Value::Text(s.to_string()))
                .map_err(|e| Error::UnsupportedValue(format!("invalid UTF-8 text: {e}"))),
            ValueRef::Blob(_) => Err(Error::UnsupportedValue(
                "blob columns cannot be replicated".to_string(),
            )),
        }
    }

    /// Converts a JSON scalar. Booleans become 0/1, as SQLite stores them.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Integer(i64::from(*b))),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Value::Integer(i)),
                None => n
                    .as_f64()
                    .map(Value::Real)
                    .ok_or_else(|| Error::UnsupportedValue(format!("number {n}"))),
            },
            serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
            other => Err(Error::UnsupportedValue(format!(
                "expected a scalar, found {other}"
            ))),
        }
    }

    /// Converts to JSON.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedValue`] for NaN and infinite reals, which have no
    /// JSON form.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Real(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| {
                    Error::UnsupportedValue(format!("non-finite real {f} cannot be replicated"))
                })?,
            Value::Text(s) => serde_json::Value::String(s.clone()),
        })
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// =============================================================================
// Row
// =============================================================================

/// A row: column name → value, iterated in column-name order.
///
/// # Rust Pattern: Newtype over BTreeMap
///
/// A `BTreeMap` keeps iteration deterministic, so the JSON payload written to
/// the change log for the same row is byte-for-byte stable and the SQL built
/// from a row always lists columns in the same order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    /// Sets a column, returning the previous value.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(column.into(), value.into())
    }

    /// Removes a column.
    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.0.remove(column)
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    /// The primary key, when present and integral.
    pub fn id(&self) -> Option<i64> {
        self.get_i64(ID_COLUMN)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Column names in iteration order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Values in the same order as [`Row::columns`].
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Encodes the row as a JSON object.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let map = self
            .0
            .iter()
            .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
            .collect::<Result<serde_json::Map<_, _>>>()?;
        Ok(serde_json::Value::Object(map))
    }

    /// Decodes a JSON object into a row.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            Error::UnsupportedValue(format!("expected a JSON object, found {value}"))
        })?;

        let mut row = Row::new();
        for (column, v) in object {
            row.insert(column.clone(), Value::from_json(v)?);
        }
        Ok(row)
    }

    /// Builds a row from a result row and its column names.
    pub(crate) fn from_sql_row(row: &rusqlite::Row<'_>, names: &[String]) -> Result<Self> {
        let mut out = Row::new();
        for (i, name) in names.iter().enumerate() {
            out.insert(name.clone(), Value::from_sql_ref(row.get_ref(i)?)?);
        }
        Ok(out)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl IntoIterator for Row {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// =============================================================================
// Filter
// =============================================================================

/// The `WHERE` clause of a read or mutation.
///
/// # Variants
///
/// - `All`: no clause
/// - `Eq`: every column equals the given value (`NULL` compiles to `IS NULL`)
/// - `Raw`: caller-supplied SQL with positional `?` parameters
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    #[default]
    All,
    Eq(Row),
    Raw { sql: String, params: Vec<Value> },
}

impl Filter {
    /// A single equality condition.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(Row::new().with(column, value))
    }

    /// Adds another equality condition. On a non-`Eq` filter this wraps the
    /// existing clause in parentheses and appends the condition.
    pub fn and(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        match self {
            Filter::All => Filter::eq(column, value),
            Filter::Eq(row) => Filter::Eq(row.with(column, value)),
            raw @ Filter::Raw { .. } => {
                let (clause, mut params) = raw.to_sql();
                let (extra, extra_params) = Filter::eq(column, value).to_sql();
                params.extend(extra_params);
                Filter::Raw {
                    sql: format!(
                        "({}) AND {}",
                        clause.trim_start_matches(" WHERE "),
                        extra.trim_start_matches(" WHERE ")
                    ),
                    params,
                }
            }
        }
    }

    /// Raw SQL predicate with positional parameters.
    pub fn raw<I, V>(sql: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter::Raw {
            sql: sql.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Matches rows whose primary key is in `ids`.
    ///
    /// The list is bound as one JSON array parameter, so its length is not
    /// limited by SQLite's host parameter cap.
    pub fn ids(ids: &[i64]) -> Self {
        Filter::json_ids(ids.iter().map(|id| serde_json::Value::from(*id)).collect())
    }

    /// Like [`Filter::ids`], for keys already held as values.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedValue`] if a key has no JSON form.
    pub fn id_in(ids: &[Value]) -> Result<Self> {
        let ids = ids.iter().map(Value::to_json).collect::<Result<Vec<_>>>()?;
        Ok(Filter::json_ids(ids))
    }

    fn json_ids(ids: Vec<serde_json::Value>) -> Self {
        if ids.is_empty() {
            return Filter::Raw {
                sql: "0".to_string(),
                params: Vec::new(),
            };
        }
        Filter::Raw {
            sql: format!(
                "{} IN (SELECT value FROM json_each(?))",
                quote_ident(ID_COLUMN)
            ),
            params: vec![Value::Text(serde_json::Value::Array(ids).to_string())],
        }
    }

    /// Renders `" WHERE ..."` (or an empty string) plus its parameters.
    pub(crate) fn to_sql(&self) -> (String, Vec<Value>) {
        match self {
            Filter::All => (String::new(), Vec::new()),
            Filter::Eq(row) if row.is_empty() => (String::new(), Vec::new()),
            Filter::Eq(row) => {
                let mut params = Vec::with_capacity(row.len());
                let clauses: Vec<String> = row
                    .iter()
                    .map(|(column, value)| {
                        if value.is_null() {
                            format!("{} IS NULL", quote_ident(column))
                        } else {
                            params.push(value.clone());
                            format!("{} = ?", quote_ident(column))
                        }
                    })
                    .collect();
                (format!(" WHERE {}", clauses.join(" AND ")), params)
            }
            Filter::Raw { sql, params } => (format!(" WHERE {sql}"), params.clone()),
        }
    }
}

impl From<Row> for Filter {
    fn from(row: Row) -> Self {
        Filter::Eq(row)
    }
}

// =============================================================================
// Select
// =============================================================================

/// A read request against one table.
///
/// ```rust
/// use sqlite_rw::{Filter, Select};
///
/// let select = Select::new()
///     .filter(Filter::eq("name", "a"))
///     .order_by("id DESC")
///     .limit(10);
/// # let _ = select;
/// ```
#[derive(Debug, Clone, Default)]
pub struct Select {
    pub filter: Filter,
    /// Projection; `None` selects every column.
    pub columns: Option<Vec<String>>,
    /// Raw `ORDER BY` expression.
    pub order_by: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Select {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: impl Into<Filter>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Renders the statement for `table`.
    pub(crate) fn to_sql(&self, table: &str) -> (String, Vec<Value>) {
        let projection = match &self.columns {
            Some(cols) if !cols.is_empty() => cols
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            _ => "*".to_string(),
        };
        let (clause, params) = self.filter.to_sql();
        let mut sql = format!("SELECT {projection} FROM {}{clause}", quote_ident(table));
        if let Some(order) = &self.order_by {
            sql.push_str(&format!(" ORDER BY {order}"));
        }
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }
        (sql, params)
    }
}

impl From<Filter> for Select {
    fn from(filter: Filter) -> Self {
        Select::new().filter(filter)
    }
}

// =============================================================================
// SQL Helpers
// =============================================================================

/// Quotes an identifier for SQLite (`"name"`, doubling embedded quotes).
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `?, ?, ?` with `n` placeholders.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

// =============================================================================
// Tests
// =============================================================================
