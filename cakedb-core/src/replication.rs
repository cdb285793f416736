//! Replication protocol definitions.
//!
//! JSON messages exchanged between a replicator and a peer endpoint, plus
//! the batch content hash both sides verify.

use serde::{Deserialize, Serialize};

use crate::revision::Revision;
use crate::store::SequencedRevision;

/// Protocol version constant.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default number of revisions per change batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Upper bound a peer accepts for `limit`.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Identity and position of a peer's revision store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub uuid: String,
    pub last_seq: u64,
    pub protocol_version: u32,
}

/// A slice of a store's change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
    pub revisions: Vec<SequencedRevision>,
    /// The store's newest sequence when the batch was read.
    pub last_seq: u64,
    pub content_hash: String,
}

impl ChangeBatch {
    pub fn new(revisions: Vec<SequencedRevision>, last_seq: u64) -> Self {
        let content_hash = compute_content_hash(revisions.iter().map(|s| &s.revision));
        Self {
            revisions,
            last_seq,
            content_hash,
        }
    }

    pub fn verify_content_hash(&self) -> bool {
        compute_content_hash(self.revisions.iter().map(|s| &s.revision)) == self.content_hash
    }

    /// Sequence of the last revision in the batch, if any.
    pub fn high_water(&self) -> Option<u64> {
        self.revisions.last().map(|s| s.seq)
    }
}

/// Revisions sent to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub revisions: Vec<Revision>,
    pub content_hash: String,
}

impl PushRequest {
    pub fn new(revisions: Vec<Revision>) -> Self {
        let content_hash = compute_content_hash(revisions.iter());
        Self {
            revisions,
            content_hash,
        }
    }

    pub fn verify_content_hash(&self) -> bool {
        compute_content_hash(self.revisions.iter()) == self.content_hash
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    /// Revisions written by the receiver.
    pub accepted: usize,
    /// Revisions the receiver already had.
    pub ignored: usize,
}

/// SHA-256 over the ordered revision ids and commands, hex encoded.
pub fn compute_content_hash<'a>(revisions: impl IntoIterator<Item = &'a Revision>) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for rev in revisions {
        hasher.update((rev.id.len() as u64).to_le_bytes());
        hasher.update(rev.id.as_bytes());
        hasher.update((rev.command.len() as u64).to_le_bytes());
        hasher.update(rev.command.as_bytes());
    }
    hex::encode(hasher.finalize())
}
