//! Revision store abstraction.
//!
//! The revision log is backed by a document store that can put, get and
//! range-query revisions, maintain indexes, and expose a sequenced change
//! feed for replication. The provider is chosen at compile time; the only
//! one shipped is [`crate::sqlite_store::SqliteRevisionStore`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::revision::{Revision, RevisionUpdate};

/// Name of the `(commitTime, type)` index recovery relies on.
pub const COMMIT_INDEX: &str = "revision_commit_time_type";

/// A named index over revision fields (document field names, e.g. `commitTime`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
}

impl IndexSpec {
    /// The index recovery range queries run on.
    pub fn commit_time_kind() -> Self {
        Self {
            name: COMMIT_INDEX.to_string(),
            fields: vec!["commitTime".to_string(), "type".to_string()],
        }
    }
}

/// Range query over committed revisions, ascending by `commitTime`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionQuery {
    /// Exclusive lower bound on `commitTime`.
    pub commit_time_gt: i64,
    pub kind: String,
    pub limit: Option<usize>,
}

/// A revision together with its position in the local change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedRevision {
    pub seq: u64,
    pub revision: Revision,
}

/// Per-peer replication progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationCheckpoint {
    pub peer: String,
    /// Last remote sequence pulled from the peer.
    pub pulled_seq: u64,
    /// Last local sequence pushed to the peer.
    pub pushed_seq: u64,
}

impl ReplicationCheckpoint {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            ..Default::default()
        }
    }
}

/// Storage provider for the revision log.
#[async_trait]
pub trait RevisionStore: Send + Sync {
    /// Stable identity of this store.
    async fn uuid(&self) -> Result<String>;

    /// Insert a new revision. Fails with `Conflict` if the id exists.
    /// Returns the assigned change-feed sequence.
    async fn put(&self, revision: &Revision) -> Result<u64>;

    /// Insert a revision received from a peer. Existing revisions are left
    /// untouched unless the stored copy is still pending and the incoming one
    /// is sealed. Returns whether anything was written.
    async fn put_replicated(&self, revision: &Revision) -> Result<bool>;

    async fn get(&self, id: &str) -> Result<Option<Revision>>;

    /// Seal a pending revision.
    async fn update(&self, id: &str, update: &RevisionUpdate, now: i64) -> Result<Revision>;

    async fn find(&self, query: &RevisionQuery) -> Result<Vec<Revision>>;

    async fn create_index(&self, spec: &IndexSpec) -> Result<()>;

    async fn drop_index(&self, name: &str) -> Result<()>;

    async fn list_indexes(&self) -> Result<Vec<IndexSpec>>;

    /// Revisions whose sequence is strictly greater than `seq`, ascending.
    async fn changes_since(&self, seq: u64, limit: usize) -> Result<Vec<SequencedRevision>>;

    async fn last_seq(&self) -> Result<u64>;

    async fn replication_checkpoint(&self, peer: &str) -> Result<ReplicationCheckpoint>;

    async fn save_replication_checkpoint(&self, checkpoint: &ReplicationCheckpoint) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Delete files left over from a previous store at `path`.
///
/// Only runs when `path` itself does not exist: every sibling whose file name
/// starts with the store's file name (case-insensitive) is removed, which
/// clears orphaned `-journal`, `-wal` and `-shm` files of a crashed run.
pub fn sweep_stale_siblings(path: &Path) -> Result<Vec<PathBuf>> {
    if path.exists() {
        return Ok(Vec::new());
    }
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
        return Ok(Vec::new());
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut removed = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().to_lowercase();
        if file_name.starts_with(&name) && entry.file_type()?.is_file() {
            let stale = entry.path();
            tracing::info!("Deleting stale revision store file {:?}", stale);
            fs::remove_file(&stale)?;
            removed.push(stale);
        }
    }
    Ok(removed)
}
