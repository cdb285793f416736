//! Engine wiring and startup sequence.

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::CakeConfig;
use crate::database::Database;
use crate::error::{CakeError, Result};
use crate::interceptor::{AppendWorker, WriteInterceptor};
use crate::kv::KvStore;
use crate::main_db::{MainDatabase, SqliteMain};
use crate::migrations::Migrator;
use crate::recovery::{RecoveryEngine, RecoveryReport};
use crate::revision_log::RevisionLog;
use crate::sync::PeerSync;

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Constructed,
    Initialized,
    SyncedOnce,
    Recovering,
    Recovered,
    RecoveryFailed,
    MigratedSchema,
    Live,
    Closed,
}

/// What `init` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    /// Whether the one-shot sync with every peer succeeded.
    pub synced: bool,
    pub recovery: Option<RecoveryReport>,
    /// Migrations applied during this startup.
    pub migrations: Vec<String>,
}

pub struct CakeDb {
    config: CakeConfig,
    log: Arc<RevisionLog>,
    main: Arc<dyn MainDatabase>,
    db: Arc<Database>,
    kv: KvStore,
    peer_sync: PeerSync,
    recovery: RecoveryEngine,
    migrator: Migrator,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    state: Mutex<Lifecycle>,
}

impl CakeDb {
    /// Open both databases and wire the capture path. Must run inside a
    /// tokio runtime; the append worker is spawned here.
    pub async fn open(config: CakeConfig) -> Result<Self> {
        config.validate()?;

        let log = Arc::new(RevisionLog::open(&config.revision.filename)?);
        let main: Arc<dyn MainDatabase> = Arc::new(SqliteMain::open(&config.main.connection.filename)?);

        let (interceptor, queue) =
            WriteInterceptor::new(config.capture.excluded_commands.clone(), log.clone());
        let db = Arc::new(Database::new(main.clone(), Arc::new(interceptor)));
        let kv = KvStore::new(db.clone());
        let worker = tokio::spawn(AppendWorker::new(queue, log.clone(), kv.clone()).run());

        let urls: Vec<String> = config.revision.remotes.iter().map(|r| r.url.clone()).collect();
        let peer_sync = PeerSync::from_urls(log.clone(), &urls, config.sync.clone())?;
        let recovery = RecoveryEngine::new(db.clone(), log.clone(), kv.clone());
        let migrator = Migrator::new(
            config.main.migrations.directory.clone(),
            config.main.migrations.table_name.clone(),
        )?;

        info!(
            main = ?config.main.connection.filename,
            revision = ?config.revision.filename,
            peers = urls.len(),
            "CakeDB opened"
        );

        Ok(Self {
            config,
            log,
            main,
            db,
            kv,
            peer_sync,
            recovery,
            migrator,
            worker: tokio::sync::Mutex::new(Some(worker)),
            state: Mutex::new(Lifecycle::Constructed),
        })
    }

    /// Startup sequence: one-shot sync (best effort), recovery, migrations,
    /// then standing replication.
    pub async fn init(&self) -> Result<InitReport> {
        self.set_state(Lifecycle::Initialized);
        let mut report = InitReport::default();

        match self.peer_sync.sync_once().await {
            Ok(_) => report.synced = true,
            Err(e) => warn!("Initial sync failed, continuing with local log: {}", e),
        }
        self.set_state(Lifecycle::SyncedOnce);

        if self.config.auto_recovery {
            self.set_state(Lifecycle::Recovering);
            match self.recovery.recover().await {
                Ok(r) => {
                    self.set_state(Lifecycle::Recovered);
                    report.recovery = Some(r);
                }
                Err(e) => {
                    error!("Recovery failed: {}", e);
                    self.set_state(Lifecycle::RecoveryFailed);
                    return Err(e);
                }
            }
        }

        if self.config.auto_migrate {
            report.migrations = self.migrator.run_pending(&self.db).await?;
            self.set_state(Lifecycle::MigratedSchema);
        }

        self.peer_sync.sync_live().await;
        self.set_state(Lifecycle::Live);
        info!(
            synced = report.synced,
            migrations = report.migrations.len(),
            "CakeDB is live"
        );
        Ok(report)
    }

    /// Intercepted handle to the main database.
    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn log(&self) -> &Arc<RevisionLog> {
        &self.log
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn peer_sync(&self) -> &PeerSync {
        &self.peer_sync
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    pub fn config(&self) -> &CakeConfig {
        &self.config
    }

    pub fn state(&self) -> Lifecycle {
        self.state.lock().map(|s| *s).unwrap_or(Lifecycle::Closed)
    }

    pub fn is_live(&self) -> bool {
        self.peer_sync.is_any_live()
    }

    /// Current `revision_point`.
    pub async fn checkpoint(&self) -> Result<Option<String>> {
        self.kv.checkpoint().await
    }

    /// Wait for every statement captured so far to reach the log.
    pub async fn settle(&self) {
        self.db.interceptor().settle().await;
    }

    /// Stop replication, drain the append queue, then close both stores.
    /// Every step is attempted; the first store error is returned.
    pub async fn close(&self) -> Result<()> {
        self.peer_sync.close_all().await;

        self.db.interceptor().shutdown();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                error!("Append worker ended abnormally: {}", e);
            }
        }

        let mut first_error: Option<CakeError> = None;
        if let Err(e) = self.log.close().await {
            error!("Failed to close revision log: {}", e);
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.main.close().await {
            error!("Failed to close main database: {}", e);
            first_error.get_or_insert(e);
        }

        self.set_state(Lifecycle::Closed);
        info!("CakeDB closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn set_state(&self, next: Lifecycle) {
        match self.state.lock() {
            Ok(mut state) => {
                tracing::debug!("Lifecycle {:?} -> {:?}", *state, next);
                *state = next;
            }
            Err(e) => error!("Lifecycle lock poisoned: {}", e),
        }
    }
}
