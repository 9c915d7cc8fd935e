//! Boundary between the engine and the storage backend.
//!
//! The engine only ever prepares statements, executes them with named
//! bindings, and brackets work in savepoints. [`sqlite::SqliteDatastore`]
//! implements this over `rusqlite`.
pub mod sqlite;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sqlite::SqliteDatastore;

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("statement is closed: {0}")]
    Closed(String),

    #[error("{0}")]
    Backend(String),
}

/// A SQL value as stored and bound.
///
/// Untagged, so configuration files and JSON arguments can write plain
/// literals: `42`, `1.5`, `"text"`, `null`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{:?}", r),
            Value::Text(s) => write!(f, "{}", s),
            Value::Blob(b) => {
                write!(f, "x'")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                write!(f, "'")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
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

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
    }
}

/// Rows produced by one statement execution.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: usize,
}

impl ResultSet {
    /// Value at `row` for the column named `column`.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(index)
    }
}

/// Named parameter bindings, keyed with their sigil (`$id`, `@caller`).
pub type Bindings = BTreeMap<String, Value>;

pub trait Datastore: Send + Sync {
    fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>, DatastoreError>;

    /// Opens a savepoint. Savepoints nest; each must be committed or rolled
    /// back in reverse order of opening.
    fn savepoint(&self) -> Result<Box<dyn Savepoint>, DatastoreError>;
}

pub trait PreparedStatement: Send + Sync {
    fn sql(&self) -> &str;

    /// Runs the statement. Parameters missing from `bindings` bind NULL.
    fn execute(&self, bindings: &Bindings) -> Result<ResultSet, DatastoreError>;

    /// Whether executing the statement writes to the datastore.
    fn is_mutative(&self) -> bool;

    /// Releases the statement; later executions fail.
    fn close(&self) -> Result<(), DatastoreError>;
}

pub trait Savepoint: Send {
    fn name(&self) -> &str;

    fn commit(self: Box<Self>) -> Result<(), DatastoreError>;

    fn rollback(self: Box<Self>) -> Result<(), DatastoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_untagged_json() {
        let values: Vec<Value> = serde_json::from_str(r#"[null, 42, 1.5, "x", [1, 2]]"#).unwrap();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Integer(42),
                Value::Real(1.5),
                Value::Text("x".into()),
                Value::Blob(vec![1, 2]),
            ]
        );
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Null.to_string(), "NULL");
        assert_eq!(Value::from(7).to_string(), "7");
        assert_eq!(Value::from("abc").to_string(), "abc");
        assert_eq!(Value::Blob(vec![0xde, 0xad]).to_string(), "x'dead'");
    }

    #[test]
    fn test_result_set_get() {
        let rs = ResultSet {
            columns: vec!["id".into(), "name".into()],
            rows: vec![vec![Value::from(1), Value::from("ann")]],
            rows_affected: 0,
        };
        assert_eq!(rs.get(0, "name"), Some(&Value::from("ann")));
        assert_eq!(rs.get(1, "name"), None);
        assert_eq!(rs.get(0, "missing"), None);
    }
}
