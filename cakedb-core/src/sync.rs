//! Peer sync coordinator.
//!
//! Replicates the revision log with every configured peer, once to
//! completion or continuously with retry, and infers each peer's
//! connectivity from the transfer events a standing replication emits.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{CakeError, Result};
use crate::revision_log::RevisionLog;
use crate::store::RevisionStore;
use crate::transport::{PeerTransport, transport_for};

/// Transfer event of a replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A replication pass started moving data.
    Active,
    /// A batch was transferred.
    Change { pushed: usize, pulled: usize },
    /// The pass is over; carries the error if it failed.
    Paused(Option<String>),
    Error(String),
    /// The replication finished (one-shot) or was cancelled (live).
    Complete,
}

/// A [`SyncEvent`] tagged with the peer it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub peer: String,
    pub event: SyncEvent,
}

/// Edge flags and derived liveness of one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerState {
    pub active: bool,
    pub changed: bool,
    pub live: bool,
}

impl PeerState {
    /// Fold one event into the state. On `Paused`, an `Active` without any
    /// `Change` means the peer went away; `Active` plus `Change` means it is
    /// reachable. Both flags reset after every `Paused`.
    pub fn observe(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::Active => self.active = true,
            SyncEvent::Change { .. } => self.changed = true,
            SyncEvent::Paused(_) => {
                if self.active && !self.changed {
                    self.live = false;
                } else if self.active && self.changed {
                    self.live = true;
                }
                self.active = false;
                self.changed = false;
            }
            SyncEvent::Error(_) | SyncEvent::Complete => {}
        }
    }
}

/// Delay before retry number `consecutive_failures` (1-based).
pub fn backoff_delay(consecutive_failures: u32, config: &SyncConfig) -> Duration {
    const MAX_EXPONENT: u32 = 16;

    let exponent = consecutive_failures.saturating_sub(1).min(MAX_EXPONENT);
    let ms = config
        .retry_base_ms
        .saturating_mul(1u64 << exponent)
        .min(config.retry_max_ms);
    Duration::from_millis(ms)
}

/// A configured peer plus its runtime state.
pub struct PeerEndpoint {
    transport: Arc<dyn PeerTransport>,
    state: Mutex<PeerState>,
}

impl PeerEndpoint {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            transport,
            state: Mutex::new(PeerState::default()),
        }
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn state(&self) -> PeerState {
        self.state.lock().map(|s| *s).unwrap_or_default()
    }

    fn emit(&self, event: SyncEvent, events: &broadcast::Sender<PeerEvent>) {
        let (before, after) = match self.state.lock() {
            Ok(mut state) => {
                let before = state.live;
                state.observe(&event);
                (before, state.live)
            }
            Err(e) => {
                error!("Peer state lock poisoned: {}", e);
                return;
            }
        };
        if before != after {
            if after {
                info!(peer = %self.url(), "Peer went online");
            } else {
                info!(peer = %self.url(), "Peer went offline");
            }
        }
        debug!(peer = %self.url(), ?event, "Sync event");
        let _ = events.send(PeerEvent {
            peer: self.url().to_string(),
            event,
        });
    }
}

/// Result of one replication pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationSummary {
    /// Revisions the peer accepted from us.
    pub pushed: usize,
    /// Revisions we accepted from the peer.
    pub pulled: usize,
}

/// Run one full push-then-pull pass against `peer`, resuming from the
/// persisted replication checkpoint.
pub async fn replicate_once(
    store: &dyn RevisionStore,
    peer: &PeerEndpoint,
    config: &SyncConfig,
    events: &broadcast::Sender<PeerEvent>,
) -> Result<ReplicationSummary> {
    let url = peer.url().to_string();
    let transport = peer.transport();
    let mut checkpoint = store.replication_checkpoint(&url).await?;
    let mut summary = ReplicationSummary::default();

    // Push
    loop {
        let changes = store.changes_since(checkpoint.pushed_seq, config.batch_size).await?;
        let Some(high) = changes.last().map(|c| c.seq) else {
            break;
        };
        let count = changes.len();
        let result = transport
            .push(changes.into_iter().map(|c| c.revision).collect())
            .await?;
        checkpoint.pushed_seq = high;
        store.save_replication_checkpoint(&checkpoint).await?;
        summary.pushed += result.accepted;
        debug!(
            peer = %url,
            batch_size = count,
            accepted = result.accepted,
            ignored = result.ignored,
            "Pushed batch"
        );
        peer.emit(SyncEvent::Change { pushed: count, pulled: 0 }, events);
    }

    // Pull
    loop {
        let batch = transport
            .changes_since(checkpoint.pulled_seq, config.batch_size)
            .await?;
        if !batch.verify_content_hash() {
            return Err(CakeError::peer(&url, "change batch content hash mismatch"));
        }
        let Some(high) = batch.high_water() else {
            break;
        };
        let mut accepted = 0;
        for change in &batch.revisions {
            change.revision.validate()?;
            if store.put_replicated(&change.revision).await? {
                accepted += 1;
            }
        }
        checkpoint.pulled_seq = high;
        store.save_replication_checkpoint(&checkpoint).await?;
        summary.pulled += accepted;
        debug!(
            peer = %url,
            batch_size = batch.revisions.len(),
            accepted,
            "Pulled batch"
        );
        peer.emit(
            SyncEvent::Change { pushed: 0, pulled: batch.revisions.len() },
            events,
        );
        if high >= batch.last_seq {
            break;
        }
    }

    Ok(summary)
}

/// Whether either side has changes past the replication checkpoint.
async fn has_pending_work(store: &dyn RevisionStore, peer: &PeerEndpoint) -> Result<bool> {
    let checkpoint = store.replication_checkpoint(peer.url()).await?;
    if store.last_seq().await? > checkpoint.pushed_seq {
        return Ok(true);
    }
    let info = peer.transport().info().await?;
    Ok(info.last_seq > checkpoint.pulled_seq)
}

/// Standing replication loop for one peer.
async fn run_live(
    log: Arc<RevisionLog>,
    peer: Arc<PeerEndpoint>,
    config: SyncConfig,
    events: broadcast::Sender<PeerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(peer = %peer.url(), "Live replication started");
    let mut appended = log.subscribe();
    let mut failures: u32 = 0;
    let poll = Duration::from_millis(config.poll_interval_ms);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let work = if failures > 0 {
            Ok(true)
        } else {
            has_pending_work(log.store().as_ref(), &peer).await
        };

        match work {
            Ok(false) => {}
            Ok(true) => {
                peer.emit(SyncEvent::Active, &events);
                match replicate_once(log.store().as_ref(), &peer, &config, &events).await {
                    Ok(summary) => {
                        if failures > 0 {
                            info!(peer = %peer.url(), failures, "Replication recovered");
                        }
                        failures = 0;
                        debug!(peer = %peer.url(), pushed = summary.pushed, pulled = summary.pulled, "Pass complete");
                        peer.emit(SyncEvent::Paused(None), &events);
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(peer = %peer.url(), failures, "Replication failed: {}", e);
                        peer.emit(SyncEvent::Error(e.to_string()), &events);
                        peer.emit(SyncEvent::Paused(Some(e.to_string())), &events);
                    }
                }
            }
            Err(e) => {
                failures += 1;
                warn!(peer = %peer.url(), failures, "Peer unreachable: {}", e);
                peer.emit(SyncEvent::Active, &events);
                peer.emit(SyncEvent::Error(e.to_string()), &events);
                peer.emit(SyncEvent::Paused(Some(e.to_string())), &events);
            }
        }

        let delay = if failures > 0 {
            backoff_delay(failures, &config)
        } else {
            poll
        };

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = appended.changed(), if failures == 0 => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    peer.emit(SyncEvent::Complete, &events);
    info!(peer = %peer.url(), "Live replication stopped");
}

pub struct PeerSync {
    log: Arc<RevisionLog>,
    peers: Vec<Arc<PeerEndpoint>>,
    config: SyncConfig,
    events: broadcast::Sender<PeerEvent>,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl PeerSync {
    pub fn new(log: Arc<RevisionLog>, transports: Vec<Arc<dyn PeerTransport>>, config: SyncConfig) -> Self {
        Self {
            log,
            peers: transports
                .into_iter()
                .map(|t| Arc::new(PeerEndpoint::new(t)))
                .collect(),
            config,
            events: broadcast::channel(1024).0,
            shutdown: watch::channel(false).0,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Build transports for the given peer URLs.
    pub fn from_urls(log: Arc<RevisionLog>, urls: &[String], config: SyncConfig) -> Result<Self> {
        let transports = urls
            .iter()
            .map(|u| transport_for(u))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(log, transports, config))
    }

    pub fn peers(&self) -> &[Arc<PeerEndpoint>] {
        &self.peers
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Replicate with every peer to completion, in parallel. Fails on the
    /// first failing peer.
    pub async fn sync_once(&self) -> Result<Vec<ReplicationSummary>> {
        let store = self.log.store().as_ref();
        let passes = self.peers.iter().map(|peer| async move {
            let summary = replicate_once(store, peer, &self.config, &self.events)
                .await
                .inspect_err(|e| peer.emit(SyncEvent::Error(e.to_string()), &self.events))?;
            info!(peer = %peer.url(), pushed = summary.pushed, pulled = summary.pulled, "One-shot sync complete");
            peer.emit(SyncEvent::Complete, &self.events);
            Ok::<_, CakeError>(summary)
        });
        futures::future::try_join_all(passes).await
    }

    /// Start a standing replication per peer. Returns immediately.
    pub async fn sync_live(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("Live replication already running");
            return;
        }
        if *self.shutdown.borrow() {
            warn!("Peer sync is closed, not starting live replication");
            return;
        }
        for peer in &self.peers {
            tasks.push(tokio::spawn(run_live(
                self.log.clone(),
                peer.clone(),
                self.config.clone(),
                self.events.clone(),
                self.shutdown.subscribe(),
            )));
        }
    }

    pub fn is_any_live(&self) -> bool {
        self.peers.iter().any(|p| p.state().live)
    }

    pub fn peer_states(&self) -> Vec<(String, PeerState)> {
        self.peers
            .iter()
            .map(|p| (p.url().to_string(), p.state()))
            .collect()
    }

    /// Cancel every standing replication and close every transport.
    pub async fn close_all(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Live replication task failed: {}", e);
            }
        }
        for peer in &self.peers {
            if let Err(e) = peer.transport().close().await {
                warn!(peer = %peer.url(), "Failed to close peer: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(events: &[SyncEvent]) -> PeerState {
        let mut state = PeerState::default();
        for e in events {
            state.observe(e);
        }
        state
    }

    #[test]
    fn test_liveness_transitions() {
        let change = SyncEvent::Change { pushed: 1, pulled: 0 };

        let online = run(&[SyncEvent::Active, change.clone(), SyncEvent::Paused(None)]);
        assert!(online.live);
        assert!(!online.active && !online.changed);

        let offline = run(&[
            SyncEvent::Active,
            change,
            SyncEvent::Paused(None),
            SyncEvent::Active,
            SyncEvent::Paused(Some("connection refused".into())),
        ]);
        assert!(!offline.live);

        assert!(!run(&[SyncEvent::Active, SyncEvent::Paused(None)]).live);
    }

    #[test]
    fn test_paused_without_active_keeps_liveness() {
        let mut state = PeerState { live: true, ..Default::default() };
        state.observe(&SyncEvent::Paused(None));
        assert!(state.live);
        state.observe(&SyncEvent::Change { pushed: 0, pulled: 1 });
        state.observe(&SyncEvent::Paused(None));
        assert!(state.live);
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let config = SyncConfig::default();
        assert_eq!(backoff_delay(1, &config), Duration::from_millis(500));
        assert_eq!(backoff_delay(2, &config), Duration::from_millis(1000));
        assert_eq!(backoff_delay(4, &config), Duration::from_millis(4000));
        assert_eq!(backoff_delay(40, &config), Duration::from_millis(30_000));
    }
}
