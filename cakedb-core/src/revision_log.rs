//! Revision log: append-only history of captured statements.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{CakeError, Result};
use crate::revision::{MonotonicClock, REVISION_KIND, Revision, RevisionStatus, RevisionUpdate};
use crate::sqlite_store::SqliteRevisionStore;
use crate::store::{COMMIT_INDEX, IndexSpec, RevisionQuery, RevisionStore};

/// Typed front end over a [`RevisionStore`].
pub struct RevisionLog {
    store: Arc<dyn RevisionStore>,
    clock: MonotonicClock,
    appended: watch::Sender<u64>,
}

impl RevisionLog {
    pub fn new(store: Arc<dyn RevisionStore>) -> Self {
        Self::with_clock(store, MonotonicClock::new())
    }

    fn with_clock(store: Arc<dyn RevisionStore>, clock: MonotonicClock) -> Self {
        Self {
            store,
            clock,
            appended: watch::channel(0).0,
        }
    }

    /// Open a SQLite-backed log at `path`. New timestamps continue after the
    /// newest `commitTime` already stored.
    pub fn open(path: &Path) -> Result<Self> {
        let store = SqliteRevisionStore::open(path)?;
        let floor = store.max_commit_time()?.unwrap_or(0);
        Ok(Self::with_clock(Arc::new(store), MonotonicClock::starting_after(floor)))
    }

    pub fn store(&self) -> &Arc<dyn RevisionStore> {
        &self.store
    }

    /// Bumped after every local append or update.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.appended.subscribe()
    }

    /// Current time from the log's monotonic clock.
    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Append a revision with explicit metadata and return its id.
    pub async fn append(
        &self,
        command: impl Into<String>,
        status: RevisionStatus,
        create_time: i64,
        commit_time: Option<i64>,
    ) -> Result<String> {
        let revision = Revision {
            id: crate::revision::new_revision_id(),
            kind: REVISION_KIND.to_string(),
            command: command.into(),
            status,
            create_time,
            commit_time,
        };
        self.put(&revision).await?;
        Ok(revision.id)
    }

    /// Create and seal a revision in one step.
    pub async fn append_committed(&self, command: impl Into<String>) -> Result<Revision> {
        let revision = Revision::committed(command, self.clock.now_millis());
        self.put(&revision).await?;
        Ok(revision)
    }

    /// Store an already built revision.
    pub async fn put(&self, revision: &Revision) -> Result<()> {
        self.store.put(revision).await?;
        self.appended.send_modify(|n| *n += 1);
        Ok(())
    }

    /// Record a statement that has not been committed yet.
    pub async fn write_pending(&self, command: impl Into<String>) -> Result<String> {
        let revision = Revision::pending(command, self.clock.now_millis());
        self.put(&revision).await?;
        Ok(revision.id)
    }

    /// Seal a pending revision.
    pub async fn update(&self, id: &str, update: RevisionUpdate) -> Result<Revision> {
        let revision = self
            .store
            .update(id, &update, self.clock.now_millis())
            .await?;
        self.appended.send_modify(|n| *n += 1);
        Ok(revision)
    }

    pub async fn get(&self, id: &str) -> Result<Revision> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| CakeError::NotFound(id.to_string()))
    }

    /// Committed revisions with `commitTime` strictly greater than `lower_bound`,
    /// ascending by `commitTime`.
    pub async fn find_committed_since(&self, lower_bound: i64) -> Result<Vec<Revision>> {
        self.store
            .find(&RevisionQuery {
                commit_time_gt: lower_bound,
                kind: REVISION_KIND.to_string(),
                limit: None,
            })
            .await
    }

    /// Drop and recreate the `(commitTime, type)` index.
    pub async fn rebuild_commit_index(&self) -> Result<()> {
        for index in self.store.list_indexes().await? {
            if index.name == COMMIT_INDEX {
                self.store.drop_index(&index.name).await?;
            }
        }
        self.store.create_index(&IndexSpec::commit_time_kind()).await
    }

    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_get() {
        let tmp = TempDir::new().unwrap();
        let log = RevisionLog::open(&tmp.path().join("revision.db")).unwrap();

        let id = log
            .append("insert into t values (1)", RevisionStatus::Commit, 5, Some(6))
            .await
            .unwrap();
        let rev = log.get(&id).await.unwrap();
        assert_eq!(rev.commit_time, Some(6));
        assert!(matches!(log.get("nope").await, Err(CakeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_append_rejects_commit_without_time() {
        let tmp = TempDir::new().unwrap();
        let log = RevisionLog::open(&tmp.path().join("revision.db")).unwrap();
        let err = log.append("x", RevisionStatus::Commit, 5, None).await;
        assert!(matches!(err, Err(CakeError::InvalidRevision(_))));
    }

    #[tokio::test]
    async fn test_pending_then_update() {
        let tmp = TempDir::new().unwrap();
        let log = RevisionLog::open(&tmp.path().join("revision.db")).unwrap();

        let id = log.write_pending("delete from t").await.unwrap();
        assert!(log.find_committed_since(1).await.unwrap().is_empty());

        log.update(&id, RevisionUpdate { status: Some(RevisionStatus::Commit), commit_time: None })
            .await
            .unwrap();
        let found = log.find_committed_since(1).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
    }

    #[tokio::test]
    async fn test_rebuild_commit_index_is_repeatable() {
        let tmp = TempDir::new().unwrap();
        let log = RevisionLog::open(&tmp.path().join("revision.db")).unwrap();
        log.rebuild_commit_index().await.unwrap();
        log.rebuild_commit_index().await.unwrap();
        let indexes = log.store().list_indexes().await.unwrap();
        assert_eq!(indexes.iter().filter(|i| i.name == COMMIT_INDEX).count(), 1);
    }

    #[tokio::test]
    async fn test_reopened_log_stamps_after_newest_commit() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("revision.db");
        let ahead = chrono::Utc::now().timestamp_millis() + 3_600_000;

        let log = RevisionLog::open(&path).unwrap();
        log.put(&Revision::committed("insert into t values (1)", ahead)).await.unwrap();
        log.close().await.unwrap();

        let log = RevisionLog::open(&path).unwrap();
        let next = log.append_committed("insert into t values (2)").await.unwrap();
        assert!(next.commit_time.unwrap() > ahead);
        let all = log.find_committed_since(1).await.unwrap();
        assert_eq!(all.last().unwrap().id, next.id);
    }

    #[tokio::test]
    async fn test_committed_appends_have_distinct_commit_times() {
        let tmp = TempDir::new().unwrap();
        let log = RevisionLog::open(&tmp.path().join("revision.db")).unwrap();
        let a = log.append_committed("a").await.unwrap();
        let b = log.append_committed("b").await.unwrap();
        assert!(b.commit_time > a.commit_time);
    }
}
