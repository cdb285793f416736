//! Integration tests for replication between local stores and peer liveness.

use cakedb_core::sync::ReplicationSummary;
use cakedb_core::{
    LocalPeer, PeerEvent, PeerSync, PeerTransport, RevisionLog, RevisionStore, SqliteRevisionStore,
    SyncConfig, SyncEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

fn fast_config() -> SyncConfig {
    SyncConfig {
        batch_size: 2,
        poll_interval_ms: 20,
        retry_base_ms: 20,
        retry_max_ms: 100,
    }
}

fn local_peer(tmp: &TempDir, name: &str) -> (Arc<SqliteRevisionStore>, Arc<dyn PeerTransport>) {
    let path = tmp.path().join(name);
    let store = Arc::new(SqliteRevisionStore::open(&path).unwrap());
    let peer: Arc<dyn PeerTransport> = Arc::new(LocalPeer::new(&path, store.clone()));
    (store, peer)
}

/// Wait for the first event matching `pred`.
async fn wait_for(rx: &mut broadcast::Receiver<PeerEvent>, pred: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(e) if pred(&e.event) => return e.event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for sync event")
}

#[tokio::test]
async fn test_sync_once_converges_both_directions() {
    let tmp = TempDir::new().unwrap();
    let log = Arc::new(RevisionLog::open(&tmp.path().join("local.db")).unwrap());
    let (remote_store, peer) = local_peer(&tmp, "remote.db");

    for i in 0..3 {
        log.append_committed(format!("insert into t values ({})", i)).await.unwrap();
    }
    let remote_log = RevisionLog::new(remote_store.clone());
    let r1 = remote_log.append_committed("insert into t values (100)").await.unwrap();
    let r2 = remote_log.append_committed("insert into t values (101)").await.unwrap();

    let sync = PeerSync::new(log.clone(), vec![peer], fast_config());
    let summaries = sync.sync_once().await.unwrap();
    assert_eq!(summaries, vec![ReplicationSummary { pushed: 3, pulled: 2 }]);

    assert_eq!(log.find_committed_since(1).await.unwrap().len(), 5);
    assert_eq!(remote_log.find_committed_since(1).await.unwrap().len(), 5);
    assert_eq!(log.get(&r1.id).await.unwrap(), r1);
    assert_eq!(log.get(&r2.id).await.unwrap().command, "insert into t values (101)");

    // Nothing new on either side: the next pass moves nothing.
    let summaries = sync.sync_once().await.unwrap();
    assert_eq!(summaries, vec![ReplicationSummary::default()]);

    let checkpoint = log.store().replication_checkpoint(sync.peers()[0].url()).await.unwrap();
    assert_eq!(checkpoint.pulled_seq, remote_store.last_seq().await.unwrap());

    sync.close_all().await;
}

#[tokio::test]
async fn test_sync_once_fails_when_a_peer_is_unreachable() {
    let tmp = TempDir::new().unwrap();
    let log = Arc::new(RevisionLog::open(&tmp.path().join("local.db")).unwrap());
    let (_store, good) = local_peer(&tmp, "remote.db");

    let sync = PeerSync::from_urls(log.clone(), &["http://127.0.0.1:9/todo".to_string()], fast_config())
        .unwrap();
    log.append_committed("insert into t values (1)").await.unwrap();
    assert!(sync.sync_once().await.is_err());
    sync.close_all().await;

    let sync = PeerSync::new(log, vec![good], fast_config());
    assert!(sync.sync_once().await.is_ok());
    sync.close_all().await;
}

#[tokio::test]
async fn test_live_sync_marks_reachable_peer_live() {
    let tmp = TempDir::new().unwrap();
    let log = Arc::new(RevisionLog::open(&tmp.path().join("local.db")).unwrap());
    let (remote_store, peer) = local_peer(&tmp, "remote.db");

    let sync = PeerSync::new(log.clone(), vec![peer], fast_config());
    let mut events = sync.subscribe();
    sync.sync_live().await;
    assert!(!sync.is_any_live());

    let rev = log.append_committed("insert into t values (1)").await.unwrap();

    wait_for(&mut events, |e| matches!(e, SyncEvent::Active)).await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Change { .. })).await;
    let paused = wait_for(&mut events, |e| matches!(e, SyncEvent::Paused(_))).await;
    assert_eq!(paused, SyncEvent::Paused(None));
    assert!(sync.is_any_live());
    assert!(remote_store.get(&rev.id).await.unwrap().is_some());

    sync.close_all().await;
    let states = sync.peer_states();
    assert_eq!(states.len(), 1);
    assert!(states[0].1.live);
}

#[tokio::test]
async fn test_live_sync_marks_unreachable_peer_offline() {
    let tmp = TempDir::new().unwrap();
    let log = Arc::new(RevisionLog::open(&tmp.path().join("local.db")).unwrap());
    log.append_committed("insert into t values (1)").await.unwrap();

    let sync = PeerSync::from_urls(log, &["http://127.0.0.1:9/todo".to_string()], fast_config())
        .unwrap();
    let mut events = sync.subscribe();
    sync.sync_live().await;

    wait_for(&mut events, |e| matches!(e, SyncEvent::Error(_))).await;
    let paused = wait_for(&mut events, |e| matches!(e, SyncEvent::Paused(_))).await;
    assert!(matches!(paused, SyncEvent::Paused(Some(_))));
    assert!(!sync.is_any_live());

    // Retries keep going in the background and never surface.
    wait_for(&mut events, |e| matches!(e, SyncEvent::Error(_))).await;

    sync.close_all().await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Complete)).await;
}
