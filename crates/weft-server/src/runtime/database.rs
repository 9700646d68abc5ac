//! SQLite store exposed to scripts as `db`.
//!
//! Every call is timed and recorded as a [`DbOperation`], including failed
//! ones, so request logs can show what a handler did.

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::time::Instant;
use weft_common::{DbOperation, Result, WeftError};

use crate::config::DatabaseConfig;

/// Outcome of `db.exec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecSummary {
    pub changes: usize,
    pub last_insert_id: i64,
}

pub struct Database {
    conn: Connection,
    operations: RefCell<Vec<DbOperation>>,
}

impl Database {
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let conn = match config {
            DatabaseConfig::InMemory => Connection::open_in_memory(),
            DatabaseConfig::File(path) => Connection::open(path),
        }
        .map_err(|e| WeftError::Database(format!("Failed to open database: {}", e)))?;

        Ok(Self {
            conn,
            operations: RefCell::new(Vec::new()),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(&DatabaseConfig::InMemory)
    }

    /// Runs a statement and returns every row as an object keyed by column
    /// name.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Map<String, Value>>> {
        let started = Instant::now();
        let result = self.query_rows(sql, params);
        self.note(sql, started, result.as_ref().map(Vec::len));
        result
    }

    /// Runs a single data-modifying statement.
    pub fn exec(&self, sql: &str, params: &[Value]) -> Result<ExecSummary> {
        let started = Instant::now();
        let result = self
            .conn
            .execute(sql, params_from_iter(params.iter().map(to_sql)))
            .map(|changes| ExecSummary {
                changes,
                last_insert_id: self.conn.last_insert_rowid(),
            })
            .map_err(|e| WeftError::Database(e.to_string()));
        self.note(sql, started, result.as_ref().map(|s| s.changes));
        result
    }

    /// Operations recorded since the last call.
    pub fn take_operations(&self) -> Vec<DbOperation> {
        std::mem::take(&mut *self.operations.borrow_mut())
    }

    fn query_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<Map<String, Value>>> {
        let db_err = |e: rusqlite::Error| WeftError::Database(e.to_string());

        let mut stmt = self.conn.prepare(sql).map_err(db_err)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt
            .query(params_from_iter(params.iter().map(to_sql)))
            .map_err(db_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            let mut object = Map::with_capacity(columns.len());
            for (i, column) in columns.iter().enumerate() {
                let value = row.get_ref(i).map_err(db_err)?;
                object.insert(column.clone(), from_sql(value));
            }
            out.push(object);
        }
        Ok(out)
    }

    fn note(&self, sql: &str, started: Instant, outcome: std::result::Result<usize, &WeftError>) {
        let (rows, error) = match outcome {
            Ok(rows) => (rows, None),
            Err(e) => (0, Some(e.to_string())),
        };
        self.operations.borrow_mut().push(DbOperation {
            sql: sql.to_string(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            rows,
            error,
        });
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}
