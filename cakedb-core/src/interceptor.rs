//! Write interceptor and append worker.
//!
//! The interceptor decides synchronously, in statement order, whether a
//! statement becomes a revision. Qualifying statements get the next issuance
//! sequence number and are queued for the [`AppendWorker`], the only task
//! that appends captured revisions and moves the checkpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::kv::{KvStore, REVISION_POINT};
use crate::revision::Revision;
use crate::revision_log::RevisionLog;
use crate::statement::{ExecMode, Statement};

/// Statement prefixes excluded from capture unless configured otherwise.
pub fn default_excluded_commands() -> Vec<String> {
    vec!["select".to_string()]
}

/// A captured revision with its issuance sequence number.
#[derive(Debug)]
pub struct AppendJob {
    pub seq: u64,
    pub revision: Revision,
}

/// Issuance and completion counters shared by interceptor and worker.
struct Progress {
    issued: AtomicU64,
    processed: watch::Sender<u64>,
}

impl Progress {
    fn mark_processed(&self, seq: u64) {
        self.processed.send_modify(|p| *p = (*p).max(seq));
    }
}

/// Receiving end handed to the [`AppendWorker`].
pub struct AppendQueue {
    rx: mpsc::UnboundedReceiver<AppendJob>,
    progress: Arc<Progress>,
}

pub struct WriteInterceptor {
    excluded: Vec<String>,
    log: Arc<RevisionLog>,
    tx: Mutex<Option<mpsc::UnboundedSender<AppendJob>>>,
    progress: Arc<Progress>,
}

impl WriteInterceptor {
    pub fn new(excluded: Vec<String>, log: Arc<RevisionLog>) -> (Self, AppendQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let progress = Arc::new(Progress {
            issued: AtomicU64::new(0),
            processed: watch::channel(0).0,
        });

        let interceptor = Self {
            excluded,
            log,
            tx: Mutex::new(Some(tx)),
            progress: progress.clone(),
        };

        (interceptor, AppendQueue { rx, progress })
    }

    /// Capture policy, applied in order: checkpoint writes, replayed
    /// statements, then excluded keywords are skipped.
    pub fn should_capture(&self, stmt: &Statement, mode: ExecMode) -> bool {
        if stmt.binds_text(REVISION_POINT) {
            return false;
        }
        if mode == ExecMode::Replay {
            return false;
        }
        !stmt.starts_with_any(&self.excluded)
    }

    /// Render a statement that is about to run. `Ok(None)` means it is not
    /// captured; an error means it must not run, since its revision could
    /// not be replayed.
    pub fn prepare(&self, stmt: &Statement, mode: ExecMode) -> Result<Option<String>> {
        if !self.should_capture(stmt, mode) {
            return Ok(None);
        }
        stmt.render().map(Some)
    }

    /// Queue the rendered command of a statement that has succeeded. Returns
    /// its issuance sequence number.
    pub fn record(&self, command: String) -> Option<u64> {
        let guard = match self.tx.lock() {
            Ok(g) => g,
            Err(e) => {
                error!("Interceptor lock poisoned: {}", e);
                return None;
            }
        };
        let Some(tx) = guard.as_ref() else {
            warn!("Interceptor is shut down, statement not captured: {}", command);
            return None;
        };

        // Issued under the lock so queue order equals sequence order.
        let seq = self.progress.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let revision = Revision::committed(command, self.log.now_millis());
        debug!(seq, revision_id = %revision.id, "Captured statement");

        if let Err(e) = tx.send(AppendJob { seq, revision }) {
            error!("Append worker is gone, dropping revision {}", e.0.revision.id);
            self.progress.mark_processed(seq);
        }
        Some(seq)
    }

    /// Highest issuance sequence number handed out so far.
    pub fn issued(&self) -> u64 {
        self.progress.issued.load(Ordering::SeqCst)
    }

    /// Wait until every job issued before this call has been processed.
    pub async fn settle(&self) {
        let target = self.issued();
        let mut rx = self.progress.processed.subscribe();
        if rx.wait_for(|p| *p >= target).await.is_err() {
            warn!("Append progress channel closed while settling");
        }
    }

    /// Stop accepting statements. The worker drains what is queued and exits.
    pub fn shutdown(&self) {
        match self.tx.lock() {
            Ok(mut tx) => {
                tx.take();
            }
            Err(e) => error!("Interceptor lock poisoned on shutdown: {}", e),
        }
    }
}

/// Appends captured revisions in FIFO order and advances the checkpoint.
pub struct AppendWorker {
    queue: AppendQueue,
    log: Arc<RevisionLog>,
    kv: KvStore,
    last_appended: Option<String>,
    checkpoint: Option<String>,
}

impl AppendWorker {
    pub fn new(queue: AppendQueue, log: Arc<RevisionLog>, kv: KvStore) -> Self {
        Self {
            queue,
            log,
            kv,
            last_appended: None,
            checkpoint: None,
        }
    }

    /// Run the worker loop (spawn as tokio task).
    pub async fn run(mut self) {
        info!("Append worker started");

        while let Some(job) = self.queue.rx.recv().await {
            self.handle(job).await;
        }

        info!("Append worker shutting down");
    }

    /// Append one job, then move the checkpoint if no newer job was issued.
    async fn handle(&mut self, job: AppendJob) {
        let AppendJob { seq, revision } = job;

        match self.log.put(&revision).await {
            Ok(()) => {
                debug!(seq, revision_id = %revision.id, "Appended revision");
                self.last_appended = Some(revision.id.clone());
            }
            Err(e) => {
                error!(seq, revision_id = %revision.id, "Failed to append revision: {}", e);
            }
        }

        let newest = self.queue.progress.issued.load(Ordering::SeqCst);
        if seq == newest {
            self.advance_checkpoint().await;
        } else {
            debug!(seq, newest, "Superseded, checkpoint left alone");
        }

        self.queue.progress.mark_processed(seq);
    }

    async fn advance_checkpoint(&mut self) {
        let Some(id) = self.last_appended.clone() else {
            return;
        };
        if self.checkpoint.as_deref() == Some(id.as_str()) {
            return;
        }
        match self.kv.set_checkpoint(&id).await {
            Ok(()) => {
                debug!(revision_id = %id, "Checkpoint advanced");
                self.checkpoint = Some(id);
            }
            Err(e) => warn!("Failed to advance checkpoint to {}: {}", id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::error::CakeError;
    use crate::main_db::{MainDatabase, SqliteMain};
    use crate::revision::RevisionUpdate;
    use crate::sqlite_store::SqliteRevisionStore;
    use crate::store::{IndexSpec, ReplicationCheckpoint, RevisionQuery, RevisionStore, SequencedRevision};
    use async_trait::async_trait;
    use rusqlite::types::Value;
    use std::collections::HashSet;
    use tempfile::TempDir;

    const SCHEMA: &str = "CREATE TABLE kv (key TEXT PRIMARY KEY, value TEXT);
         CREATE TABLE todo (id INTEGER PRIMARY KEY, title TEXT);";

    struct Fixture {
        _tmp: TempDir,
        db: Arc<Database>,
        log: Arc<RevisionLog>,
        kv: KvStore,
        worker: tokio::task::JoinHandle<()>,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let main: Arc<dyn MainDatabase> = Arc::new(SqliteMain::open(&tmp.path().join("main.db")).unwrap());
        main.execute_raw(SCHEMA).await.unwrap();

        let log = Arc::new(RevisionLog::open(&tmp.path().join("revision.db")).unwrap());
        let (interceptor, queue) = WriteInterceptor::new(default_excluded_commands(), log.clone());
        let db = Arc::new(Database::new(main, Arc::new(interceptor)));
        let kv = KvStore::new(db.clone());
        let worker = tokio::spawn(AppendWorker::new(queue, log.clone(), kv.clone()).run());

        Fixture { _tmp: tmp, db, log, kv, worker }
    }

    #[test]
    fn test_capture_policy() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(RevisionLog::open(&tmp.path().join("revision.db")).unwrap());
        let (interceptor, _queue) = WriteInterceptor::new(default_excluded_commands(), log);

        let insert = Statement::new("insert into todo (title) values (?)", vec![Value::Text("a".into())]);
        assert!(interceptor.should_capture(&insert, ExecMode::Capture));
        assert!(!interceptor.should_capture(&insert, ExecMode::Replay));
        assert!(!interceptor.should_capture(&Statement::raw("SELECT * FROM todo"), ExecMode::Capture));

        let checkpoint = Statement::new(
            "update kv set value = ? where key = ?",
            vec![Value::Text("x".into()), Value::Text("revision_point".into())],
        );
        assert!(!interceptor.should_capture(&checkpoint, ExecMode::Capture));
    }

    #[tokio::test]
    async fn test_inserts_are_logged_and_checkpoint_advances() {
        let f = fixture().await;

        for i in 0..5 {
            f.db.execute("INSERT INTO todo (title) VALUES (?1)", vec![Value::Text(format!("t{}", i))])
                .await
                .unwrap();
        }
        f.db.query("SELECT * FROM todo", vec![]).await.unwrap();
        f.db.interceptor().settle().await;

        let revisions = f.log.find_committed_since(1).await.unwrap();
        assert_eq!(revisions.len(), 5);
        assert_eq!(revisions[4].command, "INSERT INTO todo (title) VALUES ('t4')");

        let checkpoint = f.kv.checkpoint().await.unwrap();
        assert_eq!(checkpoint.as_deref(), Some(revisions[4].id.as_str()));
    }

    #[tokio::test]
    async fn test_replayed_statements_are_not_logged() {
        let f = fixture().await;
        f.db.execute_raw_in(ExecMode::Replay, "INSERT INTO todo (title) VALUES ('r')")
            .await
            .unwrap();
        f.db.interceptor().settle().await;
        assert!(f.log.find_committed_since(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_stops_worker() {
        let f = fixture().await;
        f.db.execute("INSERT INTO todo (title) VALUES ('a')", vec![]).await.unwrap();
        f.db.interceptor().shutdown();
        f.worker.await.unwrap();

        assert_eq!(f.log.find_committed_since(1).await.unwrap().len(), 1);
        // Further statements still execute but are no longer captured.
        f.db.execute("INSERT INTO todo (title) VALUES ('b')", vec![]).await.unwrap();
        assert_eq!(f.db.interceptor().issued(), 1);
    }

    #[tokio::test]
    async fn test_named_params_are_logged_as_literals() {
        let f = fixture().await;
        f.db.execute("insert into todo (title) values (:t)", vec![Value::Text("x".into())])
            .await
            .unwrap();
        f.db.interceptor().settle().await;

        let revisions = f.log.find_committed_since(1).await.unwrap();
        assert_eq!(revisions.len(), 1);
        assert_eq!(revisions[0].command, "insert into todo (title) values ('x')");
    }

    #[tokio::test]
    async fn test_dollar_identifiers_are_logged() {
        let f = fixture().await;
        f.db.main().execute_raw("CREATE TABLE w (a$b INTEGER)").await.unwrap();

        f.db.execute("insert into w (a$b) values (1)", vec![]).await.unwrap();
        f.db.execute("insert into w (a$b) values (?)", vec![Value::Integer(2)])
            .await
            .unwrap();
        f.db.interceptor().settle().await;

        let commands: Vec<String> = f
            .log
            .find_committed_since(1)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.command)
            .collect();
        assert_eq!(
            commands,
            vec!["insert into w (a$b) values (1)", "insert into w (a$b) values (2)"]
        );
    }

    #[tokio::test]
    async fn test_unrenderable_statement_never_runs() {
        let f = fixture().await;
        let err = f
            .db
            .execute(
                "insert into todo (title) values (?1)",
                vec![Value::Text("a".into()), Value::Text("b".into())],
            )
            .await;
        assert!(matches!(err, Err(CakeError::Statement(_))));

        let rows = f.db.main().query("SELECT count(*) AS n FROM todo", &[]).await.unwrap();
        assert_eq!(rows[0].integer("n"), Some(0));
        assert_eq!(f.db.interceptor().issued(), 0);
    }

    /// Revision store that refuses to `put` chosen ids.
    struct FailingStore {
        inner: SqliteRevisionStore,
        fail: Mutex<HashSet<String>>,
    }

    impl FailingStore {
        fn fail(&self, id: &str) {
            self.fail.lock().unwrap().insert(id.to_string());
        }
    }

    #[async_trait]
    impl RevisionStore for FailingStore {
        async fn uuid(&self) -> Result<String> {
            self.inner.uuid().await
        }
        async fn put(&self, revision: &Revision) -> Result<u64> {
            if self.fail.lock().unwrap().contains(&revision.id) {
                return Err(CakeError::Closed);
            }
            self.inner.put(revision).await
        }
        async fn put_replicated(&self, revision: &Revision) -> Result<bool> {
            self.inner.put_replicated(revision).await
        }
        async fn get(&self, id: &str) -> Result<Option<Revision>> {
            self.inner.get(id).await
        }
        async fn update(&self, id: &str, update: &RevisionUpdate, now: i64) -> Result<Revision> {
            self.inner.update(id, update, now).await
        }
        async fn find(&self, query: &RevisionQuery) -> Result<Vec<Revision>> {
            self.inner.find(query).await
        }
        async fn create_index(&self, index: &IndexSpec) -> Result<()> {
            self.inner.create_index(index).await
        }
        async fn drop_index(&self, name: &str) -> Result<()> {
            self.inner.drop_index(name).await
        }
        async fn list_indexes(&self) -> Result<Vec<IndexSpec>> {
            self.inner.list_indexes().await
        }
        async fn changes_since(&self, seq: u64, limit: usize) -> Result<Vec<SequencedRevision>> {
            self.inner.changes_since(seq, limit).await
        }
        async fn last_seq(&self) -> Result<u64> {
            self.inner.last_seq().await
        }
        async fn replication_checkpoint(&self, peer: &str) -> Result<ReplicationCheckpoint> {
            self.inner.replication_checkpoint(peer).await
        }
        async fn save_replication_checkpoint(&self, checkpoint: &ReplicationCheckpoint) -> Result<()> {
            self.inner.save_replication_checkpoint(checkpoint).await
        }
        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    /// Worker driven one job at a time.
    struct Stepped {
        _tmp: TempDir,
        db: Arc<Database>,
        kv: KvStore,
        store: Arc<FailingStore>,
        worker: AppendWorker,
    }

    impl Stepped {
        async fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let main: Arc<dyn MainDatabase> = Arc::new(SqliteMain::open(&tmp.path().join("main.db")).unwrap());
            main.execute_raw(SCHEMA).await.unwrap();

            let store = Arc::new(FailingStore {
                inner: SqliteRevisionStore::open(&tmp.path().join("revision.db")).unwrap(),
                fail: Mutex::new(HashSet::new()),
            });
            let log = Arc::new(RevisionLog::new(store.clone()));
            let (interceptor, queue) = WriteInterceptor::new(default_excluded_commands(), log.clone());
            let db = Arc::new(Database::new(main, Arc::new(interceptor)));
            let kv = KvStore::new(db.clone());
            let worker = AppendWorker::new(queue, log, kv.clone());
            Self { _tmp: tmp, db, kv, store, worker }
        }

        async fn insert(&self, title: &str) {
            self.db
                .execute("INSERT INTO todo (title) VALUES (?1)", vec![Value::Text(title.to_string())])
                .await
                .unwrap();
        }

        async fn next_job(&mut self) -> AppendJob {
            self.worker.queue.rx.recv().await.unwrap()
        }

        async fn checkpoint(&self) -> Option<String> {
            self.kv.checkpoint().await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_superseded_completion_leaves_checkpoint_alone() {
        let mut s = Stepped::new().await;
        s.insert("a").await;
        s.insert("b").await;
        let a = s.next_job().await;
        let b = s.next_job().await;
        let b_id = b.revision.id.clone();

        s.worker.handle(a).await;
        assert_eq!(s.checkpoint().await, None);

        s.worker.handle(b).await;
        assert_eq!(s.checkpoint().await, Some(b_id));
    }

    #[tokio::test]
    async fn test_failed_newest_append_falls_back_to_last_appended() {
        let mut s = Stepped::new().await;
        s.insert("c").await;
        s.insert("d").await;
        let c = s.next_job().await;
        let d = s.next_job().await;
        let c_id = c.revision.id.clone();
        let d_id = d.revision.id.clone();
        s.store.fail(&d_id);

        s.worker.handle(c).await;
        assert_eq!(s.checkpoint().await, None);

        s.worker.handle(d).await;
        assert_eq!(s.checkpoint().await, Some(c_id));
        assert!(s.store.get(&d_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_append_with_nothing_appended_sets_no_checkpoint() {
        let mut s = Stepped::new().await;
        s.insert("e").await;
        let e = s.next_job().await;
        s.store.fail(&e.revision.id);

        s.worker.handle(e).await;
        assert_eq!(s.checkpoint().await, None);
        s.db.interceptor().settle().await;
    }
}
