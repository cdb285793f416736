//! Checkpointed recovery.
//!
//! Replays committed revisions newer than the checkpoint against the main
//! database, strictly in `commitTime` order, moving the checkpoint after
//! each applied revision.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::database::Database;
use crate::error::{CakeError, Result};
use crate::kv::{KV_TABLE, KvStore};
use crate::revision_log::RevisionLog;
use crate::statement::ExecMode;

/// Outcome of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Ids of the revisions replayed, in order.
    pub replayed: Vec<String>,
    /// Checkpoint after the pass.
    pub checkpoint: Option<String>,
}

impl RecoveryReport {
    pub fn is_noop(&self) -> bool {
        self.replayed.is_empty()
    }
}

pub struct RecoveryEngine {
    db: Arc<Database>,
    log: Arc<RevisionLog>,
    kv: KvStore,
    guard: Mutex<()>,
}

impl RecoveryEngine {
    pub fn new(db: Arc<Database>, log: Arc<RevisionLog>, kv: KvStore) -> Self {
        Self {
            db,
            log,
            kv,
            guard: Mutex::new(()),
        }
    }

    /// Run crash recovery. Safe to call repeatedly; a pass with nothing past
    /// the checkpoint changes nothing.
    ///
    /// # Errors
    ///
    /// `RecoveryInProgress` if another pass is running, `CheckpointOrphaned`
    /// if the checkpoint names a revision the log does not have, or the first
    /// replay failure.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let _running = self.guard.try_lock().map_err(|_| CakeError::RecoveryInProgress)?;

        self.log.rebuild_commit_index().await?;

        let checkpoint = match self.kv.checkpoint().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("recovery: cannot read checkpoint, starting from the beginning: {}", e);
                None
            }
        };

        let lower_bound = match &checkpoint {
            Some(id) => {
                let revision = match self.log.get(id).await {
                    Ok(r) => r,
                    Err(CakeError::NotFound(_)) => return Err(CakeError::CheckpointOrphaned(id.clone())),
                    Err(e) => return Err(e),
                };
                let commit_time = revision.commit_time.ok_or_else(|| {
                    CakeError::InvalidRevision(format!("checkpoint {} is not committed", id))
                })?;
                commit_time.max(1)
            }
            None => 1,
        };

        let revisions = self.log.find_committed_since(lower_bound).await?;
        if revisions.is_empty() {
            tracing::debug!("recovery: nothing past checkpoint {:?}", checkpoint);
            return Ok(RecoveryReport {
                replayed: Vec::new(),
                checkpoint,
            });
        }

        tracing::info!(
            "recovery: {} revisions to replay after {:?}",
            revisions.len(),
            checkpoint
        );

        let mut report = RecoveryReport {
            replayed: Vec::with_capacity(revisions.len()),
            checkpoint,
        };
        for revision in revisions {
            tracing::debug!("replaying revision {}", revision.id);
            self.db
                .execute_raw_in(ExecMode::Replay, &revision.command)
                .await?;
            if self.db.table_exists(KV_TABLE).await? {
                self.kv.set_checkpoint(&revision.id).await?;
                report.checkpoint = Some(revision.id.clone());
            }
            report.replayed.push(revision.id);
        }

        tracing::info!("recovery: replayed {} revisions", report.replayed.len());
        Ok(report)
    }
}
