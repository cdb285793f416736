//! CakeDB Core Library
//!
//! Keeps an embedded SQLite database recoverable by logging every mutating
//! statement as a replayable revision:
//! - Write interception and ordered revision appends
//! - Revision log over a SQLite-backed document store
//! - Checkpointed recovery
//! - Peer replication over HTTP or between local stores
//! - Schema migrations and JSON configuration

pub mod error;
pub mod revision;
pub mod statement;
pub mod store;
pub mod sqlite_store;
pub mod revision_log;
pub mod main_db;
pub mod database;
pub mod kv;
pub mod interceptor;
pub mod migrations;
pub mod replication;
pub mod transport;
pub mod sync;
pub mod recovery;
pub mod config;
pub mod engine;

pub use config::{CakeConfig, SyncConfig};
pub use database::Database;
pub use engine::{CakeDb, InitReport, Lifecycle};
pub use error::{CakeError, Result};
pub use interceptor::{AppendWorker, WriteInterceptor};
pub use kv::{KvStore, REVISION_POINT};
pub use main_db::{MainDatabase, Row, SqliteMain};
pub use migrations::Migrator;
pub use recovery::{RecoveryEngine, RecoveryReport};
pub use replication::{ChangeBatch, PeerInfo, PushRequest, PushResult, PROTOCOL_VERSION};
pub use revision::{Revision, RevisionStatus, RevisionUpdate};
pub use revision_log::RevisionLog;
pub use sqlite_store::SqliteRevisionStore;
pub use statement::{ExecMode, Statement};
pub use store::{ReplicationCheckpoint, RevisionStore, SequencedRevision};
pub use sync::{PeerEvent, PeerState, PeerSync, SyncEvent};
pub use transport::{HttpPeer, LocalPeer, PeerTransport};
