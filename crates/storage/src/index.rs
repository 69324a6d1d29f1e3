//! In-memory index shared by every backend.
//!
//! Backends own durability; the index owns ordering, dedup and retention
//! bookkeeping. Callers serialize access (one lock per store).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::RangeBounds;

use declog_interchange::DecisionRecord;

use crate::error::StorageError;
use crate::record::{Annotations, ReadQuery, ReplayPage, StoredPosition, StoredRecord};

#[derive(Debug, Default)]
pub(crate) struct Index {
    /// Retained records by position.
    entries: BTreeMap<u64, StoredRecord>,
    next: u64,
    by_id: HashMap<String, StoredPosition>,
    by_hash: HashMap<String, StoredPosition>,
    by_seq: HashMap<(String, String, u64), StoredPosition>,
    /// Retained positions per actor, and per actor and run.
    by_actor: HashMap<String, BTreeSet<u64>>,
    by_stream: HashMap<String, HashMap<String, BTreeSet<u64>>>,
}

/// What an append would do, decided before anything is written.
pub(crate) enum Plan {
    Write(StoredPosition),
    Present(StoredPosition),
}

impl Index {
    /// Decide the fate of `record` without mutating the index.
    pub(crate) fn plan(&self, record: &DecisionRecord) -> Result<Plan, StorageError> {
        if let Some(pos) = self.find_duplicate(record) {
            return Ok(Plan::Present(pos));
        }
        if let Some(&pos) = self.by_seq.get(&seq_key(record)) {
            return Err(StorageError::SequenceConflict {
                actor: record.actor.clone(),
                run_id: record.run_id.clone(),
                seq: record.seq,
                position: pos.get(),
            });
        }
        Ok(Plan::Write(StoredPosition(self.next)))
    }

    /// Id match when the record has an id, otherwise entry-hash match.
    pub(crate) fn find_duplicate(&self, record: &DecisionRecord) -> Option<StoredPosition> {
        match &record.id {
            Some(id) => self.by_id.get(id).copied(),
            None => record
                .normalized_entry_hash()
                .and_then(|h| self.by_hash.get(&h).copied()),
        }
    }

    /// Record an entry at `position`. `position` must come from [`Index::plan`]
    /// or, during journal replay, be strictly greater than every prior one.
    pub(crate) fn insert(
        &mut self,
        position: StoredPosition,
        record: DecisionRecord,
        annotations: Annotations,
    ) {
        if let Some(id) = &record.id {
            self.by_id.entry(id.clone()).or_insert(position);
        }
        if let Some(hash) = record.normalized_entry_hash() {
            self.by_hash.entry(hash).or_insert(position);
        }
        self.by_seq.insert(seq_key(&record), position);
        self.by_actor
            .entry(record.actor.clone())
            .or_default()
            .insert(position.get());
        self.by_stream
            .entry(record.actor.clone())
            .or_default()
            .entry(record.run_id.clone())
            .or_default()
            .insert(position.get());
        self.next = self.next.max(position.get() + 1);
        self.entries.insert(
            position.get(),
            StoredRecord {
                position,
                annotations,
                record,
            },
        );
    }

    pub(crate) fn read(&self, query: &ReadQuery) -> ReplayPage {
        let start = query.after.map_or(0, |p| p.get().saturating_add(1));
        let mut records = Vec::new();
        let mut more = false;
        let candidates = self.candidates(query.actor.as_deref(), query.run_id.as_deref(), start..);
        for position in candidates {
            let Some(stored) = self.entries.get(&position) else {
                continue;
            };
            if !query.matches(stored) {
                continue;
            }
            if query.limit > 0 && records.len() == query.limit {
                more = true;
                break;
            }
            records.push(stored.clone());
        }
        let next = if more {
            records.last().map(|s| s.position)
        } else {
            None
        };
        ReplayPage { records, next }
    }

    /// Retained positions in `range` that can match the filter, ascending.
    /// Actor-scoped filters walk only that actor's (or stream's) positions.
    fn candidates<'a>(
        &'a self,
        actor: Option<&str>,
        run_id: Option<&str>,
        range: impl RangeBounds<u64> + 'a,
    ) -> Box<dyn Iterator<Item = u64> + 'a> {
        let set = match (actor, run_id) {
            (Some(actor), Some(run_id)) => {
                self.by_stream.get(actor).and_then(|runs| runs.get(run_id))
            }
            (Some(actor), None) => self.by_actor.get(actor),
            (None, _) => return Box::new(self.entries.range(range).map(|(&p, _)| p)),
        };
        match set {
            Some(set) => Box::new(set.range(range).copied()),
            None => Box::new(std::iter::empty()),
        }
    }

    pub(crate) fn get(&self, position: StoredPosition) -> Option<StoredRecord> {
        self.entries.get(&position.get()).cloned()
    }

    pub(crate) fn find_by_id(&self, id: &str) -> Option<StoredPosition> {
        self.by_id.get(id).copied()
    }

    pub(crate) fn find_by_hash(&self, hash: &str) -> Option<StoredPosition> {
        self.by_hash
            .get(&declog_interchange::normalize_hash(hash))
            .copied()
    }

    pub(crate) fn find_by_seq(
        &self,
        actor: &str,
        run_id: &str,
        seq: u64,
    ) -> Option<StoredPosition> {
        self.by_seq
            .get(&(actor.to_string(), run_id.to_string(), seq))
            .copied()
    }

    /// Positions `expire_front` would drop, oldest first.
    pub(crate) fn expirable(
        &self,
        actor: &str,
        run_id: Option<&str>,
        up_to: StoredPosition,
    ) -> Vec<u64> {
        self.candidates(Some(actor), run_id, ..=up_to.get()).collect()
    }

    /// Drop a prefix of an actor's timeline. Dedup keys stay so a
    /// re-delivered expired record is still recognised.
    pub(crate) fn expire(
        &mut self,
        actor: &str,
        run_id: Option<&str>,
        up_to: StoredPosition,
    ) -> usize {
        let doomed = self.expirable(actor, run_id, up_to);
        for p in &doomed {
            let Some(stored) = self.entries.remove(p) else {
                continue;
            };
            if let Some(set) = self.by_actor.get_mut(actor) {
                set.remove(p);
            }
            if let Some(set) = self
                .by_stream
                .get_mut(actor)
                .and_then(|runs| runs.get_mut(&stored.record.run_id))
            {
                set.remove(p);
            }
        }
        doomed.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn seq_key(record: &DecisionRecord) -> (String, String, u64) {
    (record.actor.clone(), record.run_id.clone(), record.seq)
}
