//! Replication over a real HTTP peer endpoint.

use cakedb_core::{CakeConfig, CakeDb, RevisionStore, SqliteRevisionStore};
use cakedb_peer::{PeerAuth, PeerServer};
use rusqlite::types::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;

const INIT_MIGRATION: &str = "
CREATE TABLE kv (key VARCHAR(255) PRIMARY KEY, value VARCHAR(255));
CREATE TABLE todo (id INTEGER PRIMARY KEY AUTOINCREMENT, title VARCHAR(255) NOT NULL);
";

struct Endpoint {
    url: String,
    store: Arc<SqliteRevisionStore>,
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<std::io::Result<()>>,
}

async fn start_endpoint(dir: &Path) -> Endpoint {
    let store = Arc::new(SqliteRevisionStore::open(&dir.join("peer.db")).unwrap());
    let server = Arc::new(PeerServer::new(store.clone(), PeerAuth::parse("todo-app:todopass")));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = watch::channel(false);
    let task = tokio::spawn(server.serve(listener, stopped));
    Endpoint {
        url: format!("http://todo-app:todopass@{}/todo", addr),
        store,
        stop,
        task,
    }
}

fn node_config(dir: &Path, remote: &str) -> CakeConfig {
    fs::create_dir_all(dir).unwrap();
    let migrations = dir.join("migrations");
    fs::create_dir_all(&migrations).unwrap();
    fs::write(migrations.join("001_init.sql"), INIT_MIGRATION).unwrap();
    CakeConfig::new(dir.join("todo.db"), dir.join("revision.db"))
        .with_migrations(migrations)
        .with_remote(remote)
}

#[tokio::test]
async fn test_second_node_rebuilds_from_http_peer() {
    let tmp = TempDir::new().unwrap();
    let endpoint = start_endpoint(tmp.path()).await;

    let first = CakeDb::open(node_config(&tmp.path().join("a"), &endpoint.url)).await.unwrap();
    let report = first.init().await.unwrap();
    assert!(report.synced);
    for i in 0..20 {
        first
            .db()
            .execute("insert into todo (title) values (?)", vec![Value::Text(format!("todo {}", i))])
            .await
            .unwrap();
    }
    first.settle().await;
    first.peer_sync().sync_once().await.unwrap();
    let local = first.log().store().last_seq().await.unwrap();
    assert_eq!(endpoint.store.last_seq().await.unwrap(), local);
    first.close().await.unwrap();

    // A node with nothing on disk pulls the log and replays it.
    let second = CakeDb::open(node_config(&tmp.path().join("b"), &endpoint.url)).await.unwrap();
    let report = second.init().await.unwrap();
    assert!(report.synced);
    assert!(report.migrations.is_empty());
    let rows = second
        .db()
        .query("SELECT count(*) AS n FROM todo", vec![])
        .await
        .unwrap();
    assert_eq!(rows[0].integer("n"), Some(20));
    second.close().await.unwrap();

    endpoint.stop.send_replace(true);
    endpoint.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_wrong_credentials_fail_initial_sync_but_not_startup() {
    let tmp = TempDir::new().unwrap();
    let endpoint = start_endpoint(tmp.path()).await;
    let bad_url = endpoint.url.replace("todopass", "nope");

    let node = CakeDb::open(node_config(&tmp.path().join("a"), &bad_url)).await.unwrap();
    let report = node.init().await.unwrap();
    assert!(!report.synced);
    assert_eq!(report.migrations, vec!["001_init.sql"]);
    node.close().await.unwrap();

    assert_eq!(endpoint.store.last_seq().await.unwrap(), 0);
    endpoint.stop.send_replace(true);
    endpoint.task.await.unwrap().unwrap();
}
