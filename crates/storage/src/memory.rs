//! Volatile backend. Durable for the life of the process only; used by
//! tests and by deployments that rebuild from an upstream journal.

use async_trait::async_trait;
use declog_interchange::DecisionRecord;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::index::{Index, Plan};
use crate::record::{
    Annotations, AppendOutcome, ReadQuery, ReplayPage, StoredPosition, StoredRecord,
};
use crate::traits::ReplayStore;

#[derive(Debug, Default)]
pub struct MemoryStore {
    index: RwLock<Index>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplayStore for MemoryStore {
    async fn append(
        &self,
        record: DecisionRecord,
        annotations: Annotations,
    ) -> Result<AppendOutcome, StorageError> {
        let mut index = self.index.write().await;
        match index.plan(&record)? {
            Plan::Present(pos) => Ok(AppendOutcome::AlreadyPresent(pos)),
            Plan::Write(pos) => {
                index.insert(pos, record, annotations);
                Ok(AppendOutcome::Appended(pos))
            }
        }
    }

    async fn expire_front(
        &self,
        actor: &str,
        run_id: Option<&str>,
        up_to: StoredPosition,
    ) -> Result<usize, StorageError> {
        Ok(self.index.write().await.expire(actor, run_id, up_to))
    }

    async fn read(&self, query: &ReadQuery) -> Result<ReplayPage, StorageError> {
        Ok(self.index.read().await.read(query))
    }

    async fn get(&self, position: StoredPosition) -> Result<Option<StoredRecord>, StorageError> {
        Ok(self.index.read().await.get(position))
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<StoredPosition>, StorageError> {
        Ok(self.index.read().await.find_by_id(id))
    }

    async fn find_by_hash(&self, entry_hash: &str) -> Result<Option<StoredPosition>, StorageError> {
        Ok(self.index.read().await.find_by_hash(entry_hash))
    }

    async fn find_by_seq(
        &self,
        actor: &str,
        run_id: &str,
        seq: u64,
    ) -> Result<Option<StoredPosition>, StorageError> {
        Ok(self.index.read().await.find_by_seq(actor, run_id, seq))
    }

    async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.index.read().await.len())
    }
}
