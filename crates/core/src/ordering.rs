//! Per-stream cursors, replay keys and the merged replay order.
//!
//! Within one `(actor, run_id)` stream, `seq` is the only order that
//! matters and it must strictly increase. Across streams, a [`ReplayKey`]
//! interleaves records: by logical counter in lamport mode, by wall
//! clock in hybrid mode while the actor's clock is trusted, and by
//! `(actor, seq)` otherwise.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use declog_interchange::{DecisionRecord, TemporalMode, TrustTier};
use declog_storage::{StoredPosition, StoredRecord};
use serde::Serialize;

/// Cursor for one `(actor, run_id)` stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActorTimeline {
    pub actor: String,
    pub run_id: String,
    /// Highest accepted seq.
    pub last_seq: u64,
    /// Highest accepted lamport counter among lamport-mode records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_lamport: Option<u64>,
    pub last_position: StoredPosition,
    /// Actor trust tier when the latest record was accepted.
    pub trust_tier: TrustTier,
    pub accepted: u64,
}

/// How an incoming record relates to its stream's cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// New stream, or seq beyond the cursor.
    Fresh,
    /// seq at or below the cursor.
    Stale { last_seq: u64 },
    /// Fresh seq, but the lamport counter went backwards.
    LamportRegression { previous: u64, incoming: u64 },
}

impl ActorTimeline {
    pub fn start(record: &DecisionRecord, tier: TrustTier, position: StoredPosition) -> Self {
        ActorTimeline {
            actor: record.actor.clone(),
            run_id: record.run_id.clone(),
            last_seq: record.seq,
            last_lamport: lamport_counter(record),
            last_position: position,
            trust_tier: tier,
            accepted: 1,
        }
    }

    pub fn admit(&self, record: &DecisionRecord) -> Admission {
        if record.seq <= self.last_seq {
            return Admission::Stale {
                last_seq: self.last_seq,
            };
        }
        if let (Some(previous), Some(incoming)) = (self.last_lamport, lamport_counter(record)) {
            if incoming <= previous {
                return Admission::LamportRegression { previous, incoming };
            }
        }
        Admission::Fresh
    }

    /// Fold in an accepted record. A backfilled record (seq below the
    /// cursor) is counted but never moves the cursor back.
    pub fn advance(&mut self, record: &DecisionRecord, tier: TrustTier, position: StoredPosition) {
        self.accepted += 1;
        self.last_position = self.last_position.max(position);
        self.trust_tier = tier;
        if record.seq <= self.last_seq {
            return;
        }
        self.last_seq = record.seq;
        if let Some(counter) = lamport_counter(record) {
            self.last_lamport = Some(self.last_lamport.map_or(counter, |c| c.max(counter)));
        }
    }
}

/// Admission for a record given its stream's cursor, if any.
pub fn admit(timeline: Option<&ActorTimeline>, record: &DecisionRecord) -> Admission {
    timeline.map_or(Admission::Fresh, |t| t.admit(record))
}

fn lamport_counter(record: &DecisionRecord) -> Option<u64> {
    match record.mode() {
        TemporalMode::Lamport => record.lamport(),
        _ => None,
    }
}

/// Cross-stream ordering key, fixed at acceptance.
///
/// The derived order compares variants first, so keys of different kinds
/// sort deterministically but without meaning; only keys of the same kind
/// carry causal or temporal order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayKey {
    Wall {
        at_ns: i128,
        counter: u64,
        actor: String,
        seq: u64,
    },
    Logical {
        counter: u64,
        actor: String,
        seq: u64,
    },
    Sequence {
        actor: String,
        run_id: String,
        seq: u64,
    },
}

/// Key for `record` given the actor's tier at acceptance.
pub fn replay_key(record: &DecisionRecord, tier: TrustTier) -> ReplayKey {
    let sequence = || ReplayKey::Sequence {
        actor: record.actor.clone(),
        run_id: record.run_id.clone(),
        seq: record.seq,
    };
    match record.mode() {
        TemporalMode::Monotonic => sequence(),
        TemporalMode::Lamport => ReplayKey::Logical {
            counter: record.lamport().unwrap_or(0),
            actor: record.actor.clone(),
            seq: record.seq,
        },
        TemporalMode::Hybrid if tier.trusts_wall_clock() => {
            match record.timestamp.value.unix_nanos() {
                Some(at_ns) => ReplayKey::Wall {
                    at_ns,
                    counter: record.lamport().unwrap_or(0),
                    actor: record.actor.clone(),
                    seq: record.seq,
                },
                None => sequence(),
            }
        }
        TemporalMode::Hybrid => sequence(),
    }
}

/// Merge stored records into replay order.
///
/// Each `(actor, run_id)` stream is first put in `seq` order; the merge then
/// repeatedly takes the stream head with the smallest [`ReplayKey`]. Ties
/// fall back to stream identity, so the output is deterministic.
pub fn replay_order(records: impl IntoIterator<Item = StoredRecord>) -> Vec<StoredRecord> {
    let mut streams: BTreeMap<(String, String), Vec<(ReplayKey, StoredRecord)>> = BTreeMap::new();
    for stored in records {
        let key = replay_key(&stored.record, stored.annotations.trust_tier);
        streams
            .entry((stored.record.actor.clone(), stored.record.run_id.clone()))
            .or_default()
            .push((key, stored));
    }

    let mut queues: Vec<std::vec::IntoIter<(ReplayKey, StoredRecord)>> = streams
        .into_values()
        .map(|mut stream| {
            stream.sort_by_key(|(_, s)| (s.record.seq, s.position));
            stream.into_iter()
        })
        .collect();

    let mut heads: Vec<Option<StoredRecord>> = Vec::with_capacity(queues.len());
    let mut heap = BinaryHeap::new();
    for (i, queue) in queues.iter_mut().enumerate() {
        match queue.next() {
            Some((key, stored)) => {
                heap.push(Reverse((key, i)));
                heads.push(Some(stored));
            }
            None => heads.push(None),
        }
    }

    let mut out = Vec::new();
    while let Some(Reverse((_, i))) = heap.pop() {
        if let Some(stored) = heads[i].take() {
            out.push(stored);
        }
        if let Some((key, stored)) = queues[i].next() {
            heap.push(Reverse((key, i)));
            heads[i] = Some(stored);
        }
    }
    out
}
