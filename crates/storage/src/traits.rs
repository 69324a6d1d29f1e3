use async_trait::async_trait;
use declog_interchange::DecisionRecord;

use crate::error::StorageError;
use crate::record::{
    Annotations, AppendOutcome, ReadQuery, ReplayPage, StoredPosition, StoredRecord,
};
use crate::replay::Replay;

/// The storage trait for declog replay backends.
///
/// A `ReplayStore` is an append-only, content-addressable log of accepted
/// decision records with a global commit order.
///
/// ## Append Semantics
///
/// `append` either durably writes the record and returns
/// [`AppendOutcome::Appended`] with a fresh position, or recognises it as
/// already present and returns [`AppendOutcome::AlreadyPresent`] with the
/// original position. A record is "already present" when an existing entry
/// has the same `id`, or, if the record has no `id`, the same entry hash.
/// A position is never reported unless the write is durable; on `Err`
/// nothing is visible.
///
/// ## Ordering
///
/// Positions are strictly increasing in commit order. Appends from
/// different actors may run concurrently; for any single actor the commit
/// order is the order in which its appends completed.
///
/// ## Retention
///
/// `expire_front` only drops a prefix (by position) of one actor's
/// timeline. Retained entries are never mutated.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` so one store can be
/// shared across ingest tasks.
#[async_trait]
pub trait ReplayStore: Send + Sync + 'static {
    // ── Writes ───────────────────────────────────────────────────────────────

    /// Append a record with its envelope annotations.
    ///
    /// Returns `Err(StorageError::SequenceConflict)` if a different record
    /// already occupies the record's `(actor, run_id, seq)`.
    async fn append(
        &self,
        record: DecisionRecord,
        annotations: Annotations,
    ) -> Result<AppendOutcome, StorageError>;

    /// Drop the retained records of `actor` (optionally one run) at or
    /// before `up_to`. Returns how many were dropped.
    async fn expire_front(
        &self,
        actor: &str,
        run_id: Option<&str>,
        up_to: StoredPosition,
    ) -> Result<usize, StorageError>;

    // ── Reads ────────────────────────────────────────────────────────────────

    /// Read one page of retained records matching `query`, in commit order.
    async fn read(&self, query: &ReadQuery) -> Result<ReplayPage, StorageError>;

    /// Fetch a retained record by position.
    async fn get(&self, position: StoredPosition) -> Result<Option<StoredRecord>, StorageError>;

    /// Position of the record accepted with this id, expired or not.
    async fn find_by_id(&self, id: &str) -> Result<Option<StoredPosition>, StorageError>;

    /// Position of the first record accepted with this entry hash.
    async fn find_by_hash(&self, entry_hash: &str) -> Result<Option<StoredPosition>, StorageError>;

    /// Position of the record holding `(actor, run_id, seq)`.
    async fn find_by_seq(
        &self,
        actor: &str,
        run_id: &str,
        seq: u64,
    ) -> Result<Option<StoredPosition>, StorageError>;

    /// Number of retained records.
    async fn len(&self) -> Result<usize, StorageError>;

    async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len().await? == 0)
    }

    /// A lazy, resumable cursor over `query`.
    fn replay(&self, query: ReadQuery) -> Replay<'_, Self>
    where
        Self: Sized,
    {
        Replay::new(self, query)
    }
}
