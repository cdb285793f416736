//! Error types for CakeDB

/// Result type for CakeDB operations
pub type Result<T> = std::result::Result<T, CakeError>;

/// Errors that can occur in the revision log, recovery and sync layers
#[derive(Debug, thiserror::Error)]
pub enum CakeError {
    #[error("Revision not found: {0}")]
    NotFound(String),

    #[error("Revision {0} already exists")]
    Conflict(String),

    #[error("Invalid revision: {0}")]
    InvalidRevision(String),

    #[error("Checkpoint references revision {0} which is not in the revision log")]
    CheckpointOrphaned(String),

    #[error("Recovery is already in progress")]
    RecoveryInProgress,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Statement error: {0}")]
    Statement(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Peer {url}: {message}")]
    Peer { url: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store is closed")]
    Closed,

    #[error("Lock poisoned: {0}")]
    Poisoned(String),
}

impl CakeError {
    pub fn peer(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Peer {
            url: url.into(),
            message: message.into(),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for CakeError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Poisoned(e.to_string())
    }
}
