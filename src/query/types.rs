//! Value model for rows streamed back to callers.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use std::fmt;

/// A single converted column value.
///
/// Exotic server types are normalised to `Text` or `Float` during decoding;
/// everything else keeps its natural representation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
    LocalTimestamp(NaiveDateTime),
    Date(NaiveDate),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "<null>"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Bytes(bytes) => {
                write!(f, "\\x")?;
                for byte in bytes {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Json(json) => write!(f, "{json}"),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::LocalTimestamp(ts) => write!(f, "{ts}"),
            Value::Date(date) => write!(f, "{date}"),
        }
    }
}

/// One result row, in column order.
pub type ResultRow = Vec<Value>;

/// Result column as described by the server when the query was prepared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnMeta {
    pub name: String,
    /// Server type name, e.g. `TEXT`, `INET`, `TEXT[]`
    pub type_name: String,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Positional query parameter (`$1`, `$2`, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum QueryArg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
}

impl From<bool> for QueryArg {
    fn from(v: bool) -> Self {
        QueryArg::Bool(v)
    }
}

impl From<i64> for QueryArg {
    fn from(v: i64) -> Self {
        QueryArg::Int(v)
    }
}

impl From<i32> for QueryArg {
    fn from(v: i32) -> Self {
        QueryArg::Int(v.into())
    }
}

impl From<f64> for QueryArg {
    fn from(v: f64) -> Self {
        QueryArg::Float(v)
    }
}

impl From<&str> for QueryArg {
    fn from(v: &str) -> Self {
        QueryArg::Text(v.to_string())
    }
}

impl From<String> for QueryArg {
    fn from(v: String) -> Self {
        QueryArg::Text(v)
    }
}

impl From<serde_json::Value> for QueryArg {
    fn from(v: serde_json::Value) -> Self {
        QueryArg::Json(v)
    }
}

impl From<DateTime<Utc>> for QueryArg {
    fn from(v: DateTime<Utc>) -> Self {
        QueryArg::Timestamp(v)
    }
}

impl<T: Into<QueryArg>> From<Option<T>> for QueryArg {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(QueryArg::Null)
    }
}

/// Fully drained result of a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncQueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<ResultRow>,
    pub diagnostics: Option<super::diagnostics::QueryDiagnostics>,
}

impl SyncQueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Index of the column called `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_arg_maps_none_to_null() {
        assert_eq!(QueryArg::from(None::<i64>), QueryArg::Null);
        assert_eq!(QueryArg::from(Some(5_i64)), QueryArg::Int(5));
    }

    #[test]
    fn test_bytes_display_as_hex() {
        assert_eq!(Value::Bytes(vec![0xde, 0xad]).to_string(), "\\xdead");
    }

    #[test]
    fn test_value_serializes_untagged() {
        let row: ResultRow = vec![Value::Int(1), Value::Text("a".into()), Value::Null];
        assert_eq!(serde_json::to_string(&row).unwrap(), "[1,\"a\",null]");
    }

    #[test]
    fn test_column_index_lookup() {
        let result = SyncQueryResult {
            columns: vec![ColumnMeta::new("id", "INT8"), ColumnMeta::new("name", "TEXT")],
            ..Default::default()
        };
        assert_eq!(result.column_index("name"), Some(1));
        assert_eq!(result.column_index("missing"), None);
    }
}
