//! Revision records.
//!
//! A revision is one executed mutating SQL statement, stored as fully
//! rendered SQL text so it can be replayed without any bound parameters.

use crate::error::{CakeError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Document type tag shared by every revision record.
pub const REVISION_KIND: &str = "revision";

/// Revision lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevisionStatus {
    Pending,
    Commit,
    Failure,
}

impl RevisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevisionStatus::Pending => "pending",
            RevisionStatus::Commit => "commit",
            RevisionStatus::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RevisionStatus::Pending),
            "commit" => Ok(RevisionStatus::Commit),
            "failure" => Ok(RevisionStatus::Failure),
            other => Err(CakeError::InvalidRevision(format!("unknown status '{}'", other))),
        }
    }
}

/// An immutable revision log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Directly executable SQL, all parameters rendered as literals.
    pub command: String,
    pub status: RevisionStatus,
    /// Milliseconds since the Unix epoch.
    pub create_time: i64,
    /// Milliseconds since the Unix epoch; `None` until committed.
    pub commit_time: Option<i64>,
}

impl Revision {
    /// Create a revision that is committed in the same step.
    pub fn committed(command: impl Into<String>, now: i64) -> Self {
        Self {
            id: new_revision_id(),
            kind: REVISION_KIND.to_string(),
            command: command.into(),
            status: RevisionStatus::Commit,
            create_time: now,
            commit_time: Some(now),
        }
    }

    /// Create a revision that still has to be sealed with [`RevisionUpdate`].
    pub fn pending(command: impl Into<String>, now: i64) -> Self {
        Self {
            id: new_revision_id(),
            kind: REVISION_KIND.to_string(),
            command: command.into(),
            status: RevisionStatus::Pending,
            create_time: now,
            commit_time: None,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.status == RevisionStatus::Commit
    }

    /// Check the record invariants before it is written anywhere.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(CakeError::InvalidRevision("empty id".to_string()));
        }
        if self.kind != REVISION_KIND {
            return Err(CakeError::InvalidRevision(format!(
                "{}: unexpected type '{}'",
                self.id, self.kind
            )));
        }
        if self.status == RevisionStatus::Commit && self.commit_time.is_none() {
            return Err(CakeError::InvalidRevision(format!(
                "{}: committed without commitTime",
                self.id
            )));
        }
        Ok(())
    }
}

/// Fields that may change when a pending revision is sealed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionUpdate {
    pub status: Option<RevisionStatus>,
    pub commit_time: Option<i64>,
}

impl RevisionUpdate {
    pub fn commit_at(commit_time: i64) -> Self {
        Self {
            status: Some(RevisionStatus::Commit),
            commit_time: Some(commit_time),
        }
    }

    pub fn failed() -> Self {
        Self {
            status: Some(RevisionStatus::Failure),
            commit_time: None,
        }
    }

    /// Apply this update to a pending revision.
    pub fn apply(&self, revision: &mut Revision, now: i64) -> Result<()> {
        if revision.status != RevisionStatus::Pending {
            return Err(CakeError::InvalidRevision(format!(
                "{} is already sealed as {}",
                revision.id,
                revision.status.as_str()
            )));
        }
        if let Some(status) = self.status {
            revision.status = status;
        }
        if let Some(t) = self.commit_time {
            revision.commit_time = Some(t);
        }
        if revision.status == RevisionStatus::Commit && revision.commit_time.is_none() {
            revision.commit_time = Some(now);
        }
        revision.validate()
    }
}

/// Generate a fresh revision id.
pub fn new_revision_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Millisecond clock that never hands out the same value twice.
///
/// Recovery bounds on `commitTime` exclusively, so two revisions sharing a
/// timestamp would make the later one unreachable from a checkpoint on the
/// earlier one.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock whose first reading is above `floor`, e.g. the newest
    /// `commitTime` already logged, even if the wall clock went backwards.
    pub fn starting_after(floor: i64) -> Self {
        Self {
            last: AtomicI64::new(floor),
        }
    }

    pub fn now_millis(&self) -> i64 {
        let wall = chrono::Utc::now().timestamp_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}
