//! Configuration loaded from a JSON file or built in code.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CakeError, Result};
use crate::interceptor::default_excluded_commands;
use crate::migrations::DEFAULT_MIGRATIONS_TABLE;
use crate::replication::{DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};

/// Relational client name. Both select the bundled SQLite provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MainClient {
    #[default]
    #[serde(rename = "sqlite3")]
    Sqlite3,
    #[serde(rename = "better-sqlite3")]
    BetterSqlite3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub filename: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationsConfig {
    #[serde(default = "default_migrations_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_migrations_table")]
    pub table_name: String,
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_migrations_table() -> String {
    DEFAULT_MIGRATIONS_TABLE.to_string()
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            directory: default_migrations_dir(),
            table_name: default_migrations_table(),
        }
    }
}

/// The application's main database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainConfig {
    #[serde(default)]
    pub client: MainClient,
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
}

/// The revision log and its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionConfig {
    pub filename: PathBuf,
    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    #[serde(default = "default_excluded_commands")]
    pub excluded_commands: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            excluded_commands: default_excluded_commands(),
        }
    }
}

/// Replication tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub batch_size: usize,
    /// How often an idle standing replication checks the peer.
    pub poll_interval_ms: u64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval_ms: 1000,
            retry_base_ms: 500,
            retry_max_ms: 30_000,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CakeConfig {
    pub main: MainConfig,
    pub revision: RevisionConfig,
    #[serde(default = "default_true")]
    pub auto_recovery: bool,
    #[serde(default = "default_true")]
    pub auto_migrate: bool,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl CakeConfig {
    /// Config with defaults for everything but the two database files.
    pub fn new(main_db: impl Into<PathBuf>, revision_db: impl Into<PathBuf>) -> Self {
        Self {
            main: MainConfig {
                client: MainClient::default(),
                connection: ConnectionConfig {
                    filename: main_db.into(),
                },
                migrations: MigrationsConfig::default(),
            },
            revision: RevisionConfig {
                filename: revision_db.into(),
                remotes: Vec::new(),
            },
            auto_recovery: true,
            auto_migrate: true,
            capture: CaptureConfig::default(),
            sync: SyncConfig::default(),
        }
    }

    pub fn with_migrations(mut self, directory: impl Into<PathBuf>) -> Self {
        self.main.migrations.directory = directory.into();
        self
    }

    pub fn with_remote(mut self, url: impl Into<String>) -> Self {
        self.revision.remotes.push(RemoteConfig { url: url.into() });
        self
    }

    /// Load a config file. Relative paths resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| CakeError::Config(format!("Failed to read {:?}: {}", path, e)))?;
        let mut config: CakeConfig = serde_json::from_str(&data)
            .map_err(|e| CakeError::Config(format!("Failed to parse {:?}: {}", path, e)))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        resolve(&mut self.main.connection.filename, base);
        resolve(&mut self.main.migrations.directory, base);
        resolve(&mut self.revision.filename, base);
        for remote in &mut self.revision.remotes {
            if !remote.url.contains("://") && Path::new(&remote.url).is_relative() {
                remote.url = base.join(&remote.url).to_string_lossy().into_owned();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.main.connection.filename.as_os_str().is_empty() {
            return Err(CakeError::Config("main.connection.filename is empty".to_string()));
        }
        if self.revision.filename.as_os_str().is_empty() {
            return Err(CakeError::Config("revision.filename is empty".to_string()));
        }
        if self.sync.batch_size == 0 || self.sync.batch_size > MAX_BATCH_SIZE {
            return Err(CakeError::Config(format!(
                "sync.batchSize must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }
        if self.sync.retry_base_ms == 0 || self.sync.retry_base_ms > self.sync.retry_max_ms {
            return Err(CakeError::Config(
                "sync.retryBaseMs must be positive and not above sync.retryMaxMs".to_string(),
            ));
        }
        if self.revision.remotes.iter().any(|r| r.url.trim().is_empty()) {
            return Err(CakeError::Config("revision.remotes contains an empty url".to_string()));
        }
        Ok(())
    }
}

fn resolve(path: &mut PathBuf, base: &Path) {
    if path.is_relative() && path.as_os_str() != ":memory:" {
        *path = base.join(&*path);
    }
}
