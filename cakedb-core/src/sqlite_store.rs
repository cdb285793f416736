//! SQLite-backed revision store
//!
//! Revisions live in a single `revisions` table keyed by id, with a separate
//! `seq` column that orders the local change feed. Replication progress per
//! peer is kept next to them so a resumed sync does not start from zero.

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{CakeError, Result};
use crate::revision::{Revision, RevisionStatus, RevisionUpdate};
use crate::store::{
    IndexSpec, ReplicationCheckpoint, RevisionQuery, RevisionStore, SequencedRevision,
    sweep_stale_siblings,
};

const REVISION_COLUMNS: &str = "id, type, command, status, create_time, commit_time";

fn open_store_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS revisions (
            id TEXT PRIMARY KEY,
            seq INTEGER NOT NULL UNIQUE,
            type TEXT NOT NULL,
            command TEXT NOT NULL,
            status TEXT NOT NULL,
            create_time INTEGER NOT NULL,
            commit_time INTEGER
        );
        CREATE TABLE IF NOT EXISTS replication_checkpoints (
            peer TEXT PRIMARY KEY,
            pulled_seq INTEGER NOT NULL,
            pushed_seq INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    Ok(conn)
}

/// Map a document field name to its column.
fn column_for(field: &str) -> Result<&'static str> {
    match field {
        "_id" | "id" => Ok("id"),
        "type" => Ok("type"),
        "command" => Ok("command"),
        "status" => Ok("status"),
        "createTime" => Ok("create_time"),
        "commitTime" => Ok("commit_time"),
        other => Err(CakeError::InvalidRevision(format!("unknown field '{}'", other))),
    }
}

fn field_for(column: &str) -> String {
    match column {
        "create_time" => "createTime".to_string(),
        "commit_time" => "commitTime".to_string(),
        "id" => "_id".to_string(),
        other => other.to_string(),
    }
}

fn check_index_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CakeError::InvalidRevision(format!("invalid index name '{}'", name)));
    }
    Ok(())
}

type RevisionRow = (String, String, String, String, i64, Option<i64>);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RevisionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_revision(row: RevisionRow) -> Result<Revision> {
    let (id, kind, command, status, create_time, commit_time) = row;
    Ok(Revision {
        id,
        kind,
        command,
        status: RevisionStatus::parse(&status)?,
        create_time,
        commit_time,
    })
}

fn conn_get(conn: &Connection, id: &str) -> Result<Option<Revision>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM revisions WHERE id = ?1", REVISION_COLUMNS),
            params![id],
            read_row,
        )
        .optional()?;
    row.map(into_revision).transpose()
}

fn conn_next_seq(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM revisions", [], |r| r.get(0))?)
}

fn conn_insert(conn: &Connection, rev: &Revision) -> Result<i64> {
    let seq = conn_next_seq(conn)?;
    conn.execute(
        "INSERT INTO revisions (id, seq, type, command, status, create_time, commit_time) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            rev.id,
            seq,
            rev.kind,
            rev.command,
            rev.status.as_str(),
            rev.create_time,
            rev.commit_time
        ],
    )?;
    Ok(seq)
}

/// Rewrite a stored revision and move it to the end of the change feed.
fn conn_reseal(conn: &Connection, rev: &Revision) -> Result<i64> {
    let seq = conn_next_seq(conn)?;
    conn.execute(
        "UPDATE revisions SET seq = ?2, status = ?3, commit_time = ?4 WHERE id = ?1",
        params![rev.id, seq, rev.status.as_str(), rev.commit_time],
    )?;
    Ok(seq)
}

/// SQLite-backed revision store
pub struct SqliteRevisionStore {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl SqliteRevisionStore {
    /// Open the store at `path`, sweeping stale siblings first if the store
    /// file does not exist yet.
    pub fn open(path: &Path) -> Result<Self> {
        sweep_stale_siblings(path)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = open_store_db(path)?;

        let has_uuid: Option<String> = conn
            .query_row("SELECT value FROM store_meta WHERE key = 'uuid'", [], |r| r.get(0))
            .optional()?;
        if has_uuid.is_none() {
            conn.execute(
                "INSERT INTO store_meta (key, value) VALUES ('uuid', ?1)",
                params![uuid::Uuid::new_v4().to_string()],
            )?;
        }

        tracing::debug!("Opened revision store at {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Newest `commitTime` in the store, if anything is committed.
    pub fn max_commit_time(&self) -> Result<Option<i64>> {
        self.with_conn(|c| {
            Ok(c.query_row("SELECT MAX(commit_time) FROM revisions", [], |r| r.get(0))?)
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        let guard = self.conn.lock()?;
        if guard.is_none() {
            return Err(CakeError::Closed);
        }
        Ok(guard)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn()?;
        let conn = guard.as_mut().ok_or(CakeError::Closed)?;
        f(conn)
    }
}

#[async_trait]
impl RevisionStore for SqliteRevisionStore {
    async fn uuid(&self) -> Result<String> {
        self.with_conn(|c| {
            Ok(c.query_row("SELECT value FROM store_meta WHERE key = 'uuid'", [], |r| r.get(0))?)
        })
    }

    async fn put(&self, revision: &Revision) -> Result<u64> {
        revision.validate()?;
        self.with_conn(|c| {
            let tx = c.transaction()?;
            if conn_get(&tx, &revision.id)?.is_some() {
                return Err(CakeError::Conflict(revision.id.clone()));
            }
            let seq = conn_insert(&tx, revision)?;
            tx.commit()?;
            Ok(seq as u64)
        })
    }

    async fn put_replicated(&self, revision: &Revision) -> Result<bool> {
        revision.validate()?;
        self.with_conn(|c| {
            let tx = c.transaction()?;
            let written = match conn_get(&tx, &revision.id)? {
                None => {
                    conn_insert(&tx, revision)?;
                    true
                }
                Some(existing)
                    if existing.status == RevisionStatus::Pending
                        && revision.status != RevisionStatus::Pending =>
                {
                    conn_reseal(&tx, revision)?;
                    true
                }
                Some(_) => false,
            };
            tx.commit()?;
            Ok(written)
        })
    }

    async fn get(&self, id: &str) -> Result<Option<Revision>> {
        self.with_conn(|c| conn_get(c, id))
    }

    async fn update(&self, id: &str, update: &RevisionUpdate, now: i64) -> Result<Revision> {
        self.with_conn(|c| {
            let tx = c.transaction()?;
            let mut revision =
                conn_get(&tx, id)?.ok_or_else(|| CakeError::NotFound(id.to_string()))?;
            update.apply(&mut revision, now)?;
            conn_reseal(&tx, &revision)?;
            tx.commit()?;
            Ok(revision)
        })
    }

    async fn find(&self, query: &RevisionQuery) -> Result<Vec<Revision>> {
        self.with_conn(|c| {
            let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
            let mut stmt = c.prepare_cached(&format!(
                "SELECT {} FROM revisions \
                 WHERE commit_time > ?1 AND type = ?2 AND status = 'commit' \
                 ORDER BY commit_time ASC, id ASC LIMIT ?3",
                REVISION_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![query.commit_time_gt, query.kind, limit], read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(into_revision).collect()
        })
    }

    async fn create_index(&self, spec: &IndexSpec) -> Result<()> {
        check_index_name(&spec.name)?;
        let columns = spec
            .fields
            .iter()
            .map(|f| column_for(f))
            .collect::<Result<Vec<_>>>()?;
        if columns.is_empty() {
            return Err(CakeError::InvalidRevision(format!("index '{}' has no fields", spec.name)));
        }
        self.with_conn(|c| {
            c.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS \"{}\" ON revisions ({})",
                spec.name,
                columns.join(", ")
            ))?;
            Ok(())
        })
    }

    async fn drop_index(&self, name: &str) -> Result<()> {
        check_index_name(name)?;
        self.with_conn(|c| {
            c.execute_batch(&format!("DROP INDEX IF EXISTS \"{}\"", name))?;
            Ok(())
        })
    }

    async fn list_indexes(&self) -> Result<Vec<IndexSpec>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'index' AND tbl_name = 'revisions' AND sql IS NOT NULL \
                 ORDER BY name",
            )?;
            let names: Vec<String> = stmt
                .query_map([], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);
            let mut specs = Vec::with_capacity(names.len());
            for name in names {
                let mut stmt = c.prepare(&format!("PRAGMA index_info(\"{}\")", name))?;
                let fields = stmt
                    .query_map([], |r| r.get::<_, String>(2))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
                    .iter()
                    .map(|col| field_for(col))
                    .collect();
                specs.push(IndexSpec { name, fields });
            }
            Ok(specs)
        })
    }

    async fn changes_since(&self, seq: u64, limit: usize) -> Result<Vec<SequencedRevision>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare_cached(&format!(
                "SELECT {}, seq FROM revisions WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
                REVISION_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![seq as i64, limit as i64], |r| {
                    Ok((read_row(r)?, r.get::<_, i64>(6)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(row, seq)| {
                    Ok(SequencedRevision {
                        seq: seq as u64,
                        revision: into_revision(row)?,
                    })
                })
                .collect()
        })
    }

    async fn last_seq(&self) -> Result<u64> {
        self.with_conn(|c| {
            let seq: i64 = c.query_row("SELECT COALESCE(MAX(seq), 0) FROM revisions", [], |r| r.get(0))?;
            Ok(seq as u64)
        })
    }

    async fn replication_checkpoint(&self, peer: &str) -> Result<ReplicationCheckpoint> {
        self.with_conn(|c| {
            let row: Option<(i64, i64)> = c
                .query_row(
                    "SELECT pulled_seq, pushed_seq FROM replication_checkpoints WHERE peer = ?1",
                    params![peer],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            Ok(match row {
                Some((pulled, pushed)) => ReplicationCheckpoint {
                    peer: peer.to_string(),
                    pulled_seq: pulled as u64,
                    pushed_seq: pushed as u64,
                },
                None => ReplicationCheckpoint::new(peer),
            })
        })
    }

    async fn save_replication_checkpoint(&self, checkpoint: &ReplicationCheckpoint) -> Result<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO replication_checkpoints (peer, pulled_seq, pushed_seq, updated_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(peer) DO UPDATE SET pulled_seq = excluded.pulled_seq, \
                 pushed_seq = excluded.pushed_seq, updated_at = excluded.updated_at",
                params![
                    checkpoint.peer,
                    checkpoint.pulled_seq as i64,
                    checkpoint.pushed_seq as i64,
                    chrono::Utc::now().timestamp_millis()
                ],
            )?;
            Ok(())
        })
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.lock()?.take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| CakeError::Sqlite(e))?;
            tracing::debug!("Closed revision store at {:?}", self.path);
        }
        Ok(())
    }
}
