use std::fmt;

use declog_interchange::{DecisionRecord, TrustTier};
use serde::{Deserialize, Serialize};

/// Global commit index of a stored record. Starts at 0, strictly
/// increasing, never reused (not even after retention expiry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoredPosition(pub u64);

impl StoredPosition {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StoredPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Envelope metadata recorded next to (never inside) an accepted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    /// The actor's trust tier when the record was accepted.
    pub trust_tier: TrustTier,
    /// Accepted through the backfill path with a seq at or below the cursor.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub out_of_order: bool,
    /// A signature was present but could not be verified.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub signature_unverified: bool,
}

impl Annotations {
    pub fn new(trust_tier: TrustTier) -> Self {
        Annotations {
            trust_tier,
            out_of_order: false,
            signature_unverified: false,
        }
    }
}

/// A record as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub position: StoredPosition,
    pub annotations: Annotations,
    pub record: DecisionRecord,
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Newly and durably appended.
    Appended(StoredPosition),
    /// Already present (by id, or by entry hash when the record has no id);
    /// nothing was written.
    AlreadyPresent(StoredPosition),
}

impl AppendOutcome {
    pub fn position(self) -> StoredPosition {
        match self {
            AppendOutcome::Appended(p) | AppendOutcome::AlreadyPresent(p) => p,
        }
    }
}

/// Filter and resume point for [`crate::ReplayStore::read`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadQuery {
    pub actor: Option<String>,
    pub run_id: Option<String>,
    /// Exclusive resume point: only records strictly after this position.
    pub after: Option<StoredPosition>,
    /// Page size; 0 means unlimited.
    pub limit: usize,
}

impl ReadQuery {
    pub fn all() -> Self {
        ReadQuery::default()
    }

    pub fn actor(actor: impl Into<String>) -> Self {
        ReadQuery {
            actor: Some(actor.into()),
            ..ReadQuery::default()
        }
    }

    pub fn stream(actor: impl Into<String>, run_id: impl Into<String>) -> Self {
        ReadQuery {
            actor: Some(actor.into()),
            run_id: Some(run_id.into()),
            ..ReadQuery::default()
        }
    }

    pub fn after(mut self, position: StoredPosition) -> Self {
        self.after = Some(position);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, stored: &StoredRecord) -> bool {
        self.after.map_or(true, |after| stored.position > after)
            && self
                .actor
                .as_deref()
                .map_or(true, |a| stored.record.actor == a)
            && self
                .run_id
                .as_deref()
                .map_or(true, |r| stored.record.run_id == r)
    }
}

/// One page of a read, in commit order.
#[derive(Debug, Clone, Default)]
pub struct ReplayPage {
    pub records: Vec<StoredRecord>,
    /// Resume point for the next page; `None` when the read is exhausted.
    pub next: Option<StoredPosition>,
}
