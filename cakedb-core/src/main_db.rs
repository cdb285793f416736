//! Main relational database.
//!
//! The application's own SQLite database. Everything here executes exactly
//! what it is given; capture happens one layer up in [`crate::database`].

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{CakeError, Result};

/// One result row, with column names.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    /// Column value as text, if it is text.
    pub fn text(&self, column: &str) -> Option<&str> {
        match self.get(column) {
            Some(Value::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn integer(&self, column: &str) -> Option<i64> {
        match self.get(column) {
            Some(Value::Integer(i)) => Some(*i),
            _ => None,
        }
    }
}

/// Operations the core needs from the relational engine.
#[async_trait]
pub trait MainDatabase: Send + Sync {
    /// Execute a single statement with bound parameters, returning affected rows.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<usize>;

    /// Execute raw SQL text, which may hold several statements.
    async fn execute_raw(&self, sql: &str) -> Result<()>;

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    async fn table_exists(&self, name: &str) -> Result<bool>;

    async fn close(&self) -> Result<()>;
}

fn open_main_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// SQLite main database
pub struct SqliteMain {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl SqliteMain {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = open_main_db(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        let guard = self.conn.lock()?;
        if guard.is_none() {
            return Err(CakeError::Closed);
        }
        Ok(guard)
    }
}

#[async_trait]
impl MainDatabase for SqliteMain {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let guard = self.conn()?;
        let conn = guard.as_ref().ok_or(CakeError::Closed)?;
        Ok(conn.execute(sql, params_from_iter(params.iter()))?)
    }

    async fn execute_raw(&self, sql: &str) -> Result<()> {
        let guard = self.conn()?;
        let conn = guard.as_ref().ok_or(CakeError::Closed)?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let guard = self.conn()?;
        let conn = guard.as_ref().ok_or(CakeError::Closed)?;
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(row.get::<_, Value>(i)?);
            }
            out.push(Row {
                columns: columns.clone(),
                values,
            });
        }
        Ok(out)
    }

    async fn table_exists(&self, name: &str) -> Result<bool> {
        let guard = self.conn()?;
        let conn = guard.as_ref().ok_or(CakeError::Closed)?;
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.lock()?.take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| CakeError::Sqlite(e))?;
            tracing::debug!("Closed main database at {:?}", self.path);
        }
        Ok(())
    }
}
