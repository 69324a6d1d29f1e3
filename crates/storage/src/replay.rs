use std::collections::VecDeque;

use crate::error::StorageError;
use crate::record::{ReadQuery, StoredPosition, StoredRecord};
use crate::traits::ReplayStore;

/// Page size used when the query does not set one.
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Lazy, finite, restartable traversal of a store.
///
/// Pages are fetched on demand. [`Replay::position`] is the last position
/// handed out; a new `Replay` whose query starts `after` that position
/// picks up exactly where this one stopped.
pub struct Replay<'a, S: ReplayStore> {
    store: &'a S,
    query: ReadQuery,
    buffer: VecDeque<StoredRecord>,
    exhausted: bool,
    last: Option<StoredPosition>,
}

impl<'a, S: ReplayStore> Replay<'a, S> {
    pub fn new(store: &'a S, mut query: ReadQuery) -> Self {
        if query.limit == 0 {
            query.limit = DEFAULT_PAGE_SIZE;
        }
        let last = query.after;
        Replay {
            store,
            query,
            buffer: VecDeque::new(),
            exhausted: false,
            last,
        }
    }

    /// Next record, or `None` once the read is exhausted.
    pub async fn next(&mut self) -> Result<Option<StoredRecord>, StorageError> {
        if self.buffer.is_empty() && !self.exhausted {
            self.query.after = self.last;
            let page = self.store.read(&self.query).await?;
            self.exhausted = page.next.is_none();
            self.buffer.extend(page.records);
        }
        let next = self.buffer.pop_front();
        if let Some(stored) = &next {
            self.last = Some(stored.position);
        }
        Ok(next)
    }

    /// Last position yielded (or the starting `after`).
    pub fn position(&self) -> Option<StoredPosition> {
        self.last
    }

    /// Drain the rest of the traversal.
    pub async fn collect_all(mut self) -> Result<Vec<StoredRecord>, StorageError> {
        let mut out = Vec::new();
        while let Some(stored) = self.next().await? {
            out.push(stored);
        }
        Ok(out)
    }
}
