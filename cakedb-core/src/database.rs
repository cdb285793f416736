//! Intercepted access to the main database.
//!
//! All application traffic goes through [`Database`]. A captured statement
//! is rendered before it runs, so a statement that could not be replayed
//! never reaches the main database, and is queued as a revision only once it
//! succeeded.

use rusqlite::types::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::interceptor::WriteInterceptor;
use crate::main_db::{MainDatabase, Row};
use crate::statement::{ExecMode, Statement};

pub struct Database {
    main: Arc<dyn MainDatabase>,
    interceptor: Arc<WriteInterceptor>,
}

impl Database {
    pub fn new(main: Arc<dyn MainDatabase>, interceptor: Arc<WriteInterceptor>) -> Self {
        Self { main, interceptor }
    }

    pub fn main(&self) -> &Arc<dyn MainDatabase> {
        &self.main
    }

    pub fn interceptor(&self) -> &Arc<WriteInterceptor> {
        &self.interceptor
    }

    /// Execute one statement with bound parameters and capture it.
    pub async fn execute(&self, sql: &str, params: Vec<Value>) -> Result<usize> {
        self.execute_in(ExecMode::Capture, sql, params).await
    }

    pub async fn execute_in(&self, mode: ExecMode, sql: &str, params: Vec<Value>) -> Result<usize> {
        let stmt = Statement::new(sql, params);
        let command = self.interceptor.prepare(&stmt, mode)?;
        let affected = self.main.execute(sql, &stmt.params).await?;
        if let Some(command) = command {
            self.interceptor.record(command);
        }
        Ok(affected)
    }

    /// Execute raw SQL text, possibly several statements, as one unit.
    pub async fn execute_script(&self, sql: &str) -> Result<()> {
        self.execute_raw_in(ExecMode::Capture, sql).await
    }

    pub async fn execute_raw_in(&self, mode: ExecMode, sql: &str) -> Result<()> {
        let command = self.interceptor.prepare(&Statement::raw(sql), mode)?;
        self.main.execute_raw(sql).await?;
        if let Some(command) = command {
            self.interceptor.record(command);
        }
        Ok(())
    }

    /// Run a query. Queries are observed like any other statement; the
    /// keyword filter keeps plain `select`s out of the log.
    pub async fn query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>> {
        let stmt = Statement::new(sql, params);
        let command = self.interceptor.prepare(&stmt, ExecMode::Capture)?;
        let rows = self.main.query(sql, &stmt.params).await?;
        if let Some(command) = command {
            self.interceptor.record(command);
        }
        Ok(rows)
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        self.main.table_exists(name).await
    }
}
