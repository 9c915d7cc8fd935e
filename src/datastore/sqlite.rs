//! SQLite datastore over a single `rusqlite` connection.
//!
//! Statements and savepoints share the connection behind a mutex. Savepoint
//! names come from a per-datastore counter. Savepoints opened on the
//! connection nest, so callers must not interleave two top-level savepoints;
//! the engine holds its own lock for the lifetime of each one.
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql};
use tracing::{debug, warn};

use super::{Bindings, Datastore, DatastoreError, PreparedStatement, ResultSet, Savepoint, Value};

type Shared = Arc<Mutex<Connection>>;

fn lock(conn: &Shared) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            Value::Null => ValueRef::Null,
            Value::Integer(i) => ValueRef::Integer(*i),
            Value::Real(r) => ValueRef::Real(*r),
            Value::Text(s) => ValueRef::Text(s.as_bytes()),
            Value::Blob(b) => ValueRef::Blob(b),
        }))
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(r) => Value::Real(r),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

pub struct SqliteDatastore {
    conn: Shared,
    savepoints: AtomicU64,
}

impl SqliteDatastore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatastoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, DatastoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DatastoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            savepoints: AtomicU64::new(0),
        })
    }
}

impl Datastore for SqliteDatastore {
    fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>, DatastoreError> {
        let conn = lock(&self.conn);
        let stmt = conn.prepare_cached(sql)?;
        let mutative = !stmt.readonly();
        drop(stmt);
        drop(conn);

        debug!(sql, mutative, "prepared statement");
        Ok(Box::new(SqliteStatement {
            conn: Arc::clone(&self.conn),
            sql: sql.to_string(),
            mutative,
            closed: AtomicBool::new(false),
        }))
    }

    fn savepoint(&self) -> Result<Box<dyn Savepoint>, DatastoreError> {
        let name = format!("sp_{}", self.savepoints.fetch_add(1, Ordering::Relaxed));
        lock(&self.conn).execute_batch(&format!("SAVEPOINT {}", name))?;
        Ok(Box::new(SqliteSavepoint {
            conn: Arc::clone(&self.conn),
            name,
        }))
    }
}

struct SqliteStatement {
    conn: Shared,
    sql: String,
    mutative: bool,
    closed: AtomicBool,
}

impl PreparedStatement for SqliteStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn execute(&self, bindings: &Bindings) -> Result<ResultSet, DatastoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DatastoreError::Closed(self.sql.clone()));
        }

        let conn = lock(&self.conn);
        let mut stmt = conn.prepare_cached(&self.sql)?;

        let null = Value::Null;
        for index in 1..=stmt.parameter_count() {
            let value = stmt
                .parameter_name(index)
                .and_then(|name| bindings.get(name))
                .unwrap_or(&null);
            stmt.raw_bind_parameter(index, value)?;
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        if columns.is_empty() {
            let rows_affected = stmt.raw_execute()?;
            return Ok(ResultSet {
                columns,
                rows: vec![],
                rows_affected,
            });
        }

        let mut rows = Vec::new();
        let mut cursor = stmt.raw_query();
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for index in 0..columns.len() {
                values.push(Value::from(row.get_ref(index)?));
            }
            rows.push(values);
        }
        drop(cursor);

        let rows_affected = if self.mutative {
            conn.changes() as usize
        } else {
            0
        };
        Ok(ResultSet {
            columns,
            rows,
            rows_affected,
        })
    }

    fn is_mutative(&self) -> bool {
        self.mutative
    }

    fn close(&self) -> Result<(), DatastoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(DatastoreError::Closed(self.sql.clone()));
        }
        Ok(())
    }
}

struct SqliteSavepoint {
    conn: Shared,
    name: String,
}

impl Savepoint for SqliteSavepoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn commit(self: Box<Self>) -> Result<(), DatastoreError> {
        lock(&self.conn).execute_batch(&format!("RELEASE SAVEPOINT {}", self.name))?;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), DatastoreError> {
        let result = lock(&self.conn).execute_batch(&format!(
            "ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0};",
            self.name
        ));
        if let Err(err) = &result {
            warn!(savepoint = %self.name, %err, "rollback failed");
        }
        Ok(result?)
    }
}
