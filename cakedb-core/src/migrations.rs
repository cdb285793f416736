//! Schema migrations for the main database.
//!
//! Migrations are `*.sql` files applied in file-name order. Both the scripts
//! and their bookkeeping rows go through the captured path, so the revision
//! log carries the schema history along with the data.

use rusqlite::types::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::database::Database;
use crate::error::{CakeError, Result};

pub const DEFAULT_MIGRATIONS_TABLE: &str = "migrations";

#[derive(Debug, Clone)]
pub struct Migrator {
    directory: PathBuf,
    table: String,
}

impl Migrator {
    pub fn new(directory: impl Into<PathBuf>, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(CakeError::Migration(format!("invalid tracking table name '{}'", table)));
        }
        Ok(Self {
            directory: directory.into(),
            table,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Migration files on disk, sorted by name.
    pub fn available(&self) -> Result<Vec<(String, PathBuf)>> {
        if !self.directory.exists() {
            debug!("No migrations directory at {:?}", self.directory);
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == "sql") {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    files.push((name.to_string(), path.clone()));
                }
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    /// Names already recorded in the tracking table.
    pub async fn applied(&self, db: &Database) -> Result<Vec<String>> {
        if !db.table_exists(&self.table).await? {
            return Ok(Vec::new());
        }
        let rows = db
            .query(&format!("SELECT name FROM {} ORDER BY id", self.table), vec![])
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.text("name").map(str::to_string))
            .collect())
    }

    /// Apply every migration not yet recorded. Returns the names applied.
    pub async fn run_pending(&self, db: &Database) -> Result<Vec<String>> {
        if !db.table_exists(&self.table).await? {
            db.execute_script(&format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 name TEXT NOT NULL UNIQUE, \
                 migration_time INTEGER NOT NULL)",
                self.table
            ))
            .await?;
        }

        let applied = self.applied(db).await?;
        let mut ran = Vec::new();

        for (name, path) in self.available()? {
            if applied.contains(&name) {
                continue;
            }
            let script = fs::read_to_string(&path)?;
            db.execute_script(&script)
                .await
                .map_err(|e| CakeError::Migration(format!("{}: {}", name, e)))?;
            db.execute(
                &format!("INSERT INTO {} (name, migration_time) VALUES (?1, ?2)", self.table),
                vec![
                    Value::Text(name.clone()),
                    Value::Integer(chrono::Utc::now().timestamp_millis()),
                ],
            )
            .await?;
            info!("Applied migration {}", name);
            ran.push(name);
        }

        Ok(ran)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_table_name() {
        assert!(Migrator::new("m", "migrations; drop table kv").is_err());
        assert!(Migrator::new("m", "knex_migrations").is_ok());
    }

    #[test]
    fn test_available_sorted_sql_only() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("002_b.sql"), "select 1").unwrap();
        fs::write(tmp.path().join("001_a.sql"), "select 1").unwrap();
        fs::write(tmp.path().join("README.md"), "notes").unwrap();

        let migrator = Migrator::new(tmp.path(), DEFAULT_MIGRATIONS_TABLE).unwrap();
        let names: Vec<String> = migrator.available().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["001_a.sql", "002_b.sql"]);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let migrator = Migrator::new("/nonexistent/cakedb/migrations", DEFAULT_MIGRATIONS_TABLE).unwrap();
        assert!(migrator.available().unwrap().is_empty());
    }
}
