//! Append-only NDJSON journal backend.
//!
//! Every mutation is one line:
//!
//! ```text
//! {"op":"append","position":0,"annotations":{"trust_tier":"high"},"record":{...}}
//! {"op":"expire","actor":"device:a","run_id":null,"up_to":12}
//! ```
//!
//! Lines are flushed with `sync_data` before the in-memory index changes,
//! so a position is only handed out once it is on disk. Mutations run on
//! their own task: a caller that stops awaiting does not stop the write, so
//! the file and the index never disagree.
//!
//! On open the journal is replayed to rebuild the index. A torn final line
//! (no trailing newline, does not decode) is an interrupted write and is
//! cut off; a final line that decodes but lost its newline is terminated.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use declog_interchange::DecisionRecord;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::index::{Index, Plan};
use crate::record::{
    Annotations, AppendOutcome, ReadQuery, ReplayPage, StoredPosition, StoredRecord,
};
use crate::traits::ReplayStore;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalLine {
    Append(StoredRecord),
    Expire {
        actor: String,
        run_id: Option<String>,
        up_to: StoredPosition,
    },
}

struct Inner {
    file: File,
    /// Bytes known to be durably written.
    len: u64,
    index: Index,
    /// A failed write could not be rolled back; the file may hold a partial
    /// line past `len`.
    poisoned: bool,
}

pub struct JournalStore {
    path: PathBuf,
    inner: Arc<Mutex<Inner>>,
}

/// Outcome of replaying journal bytes.
struct Replayed {
    index: Index,
    /// Length of the decodable prefix.
    good_len: u64,
    /// The last decoded line has no trailing newline.
    unterminated: bool,
}

impl JournalStore {
    /// Open (creating if absent) the journal at `path` and rebuild its index.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StorageError::Io(e)),
        };
        let Replayed {
            index,
            mut good_len,
            unterminated,
        } = rebuild(&bytes)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if good_len < bytes.len() as u64 {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = bytes.len() as u64 - good_len,
                "discarding torn journal tail"
            );
            file.set_len(good_len).await?;
            file.sync_data().await?;
        } else if unterminated {
            tracing::warn!(path = %path.display(), "terminating final journal line");
            file.write_all(b"\n").await?;
            file.sync_data().await?;
            good_len += 1;
        }
        tracing::debug!(path = %path.display(), records = index.len(), "journal opened");

        Ok(JournalStore {
            path,
            inner: Arc::new(Mutex::new(Inner {
                file,
                len: good_len,
                index,
                poisoned: false,
            })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Inner {
    fn check_writable(&self) -> Result<(), StorageError> {
        if self.poisoned {
            return Err(StorageError::Backend(
                "journal has an unrecovered partial write; reopen the store".to_string(),
            ));
        }
        Ok(())
    }

    async fn write_line(&mut self, line: &JournalLine) -> Result<(), StorageError> {
        let mut buf =
            serde_json::to_vec(line).map_err(|e| StorageError::Backend(e.to_string()))?;
        buf.push(b'\n');
        let result = async {
            self.file.write_all(&buf).await?;
            self.file.sync_data().await
        }
        .await;
        match result {
            Ok(()) => {
                self.len += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Roll the file back so a partial line cannot poison the next open.
                if let Err(rollback) = self.file.set_len(self.len).await {
                    tracing::error!(
                        error = %rollback,
                        len = self.len,
                        "journal rollback failed, refusing further writes"
                    );
                    self.poisoned = true;
                }
                Err(StorageError::Io(e))
            }
        }
    }

    async fn append(
        &mut self,
        record: DecisionRecord,
        annotations: Annotations,
    ) -> Result<AppendOutcome, StorageError> {
        self.check_writable()?;
        let position = match self.index.plan(&record)? {
            Plan::Present(pos) => return Ok(AppendOutcome::AlreadyPresent(pos)),
            Plan::Write(pos) => pos,
        };
        let line = JournalLine::Append(StoredRecord {
            position,
            annotations,
            record,
        });
        self.write_line(&line).await?;
        if let JournalLine::Append(stored) = line {
            self.index
                .insert(stored.position, stored.record, stored.annotations);
        }
        Ok(AppendOutcome::Appended(position))
    }

    async fn expire(
        &mut self,
        actor: String,
        run_id: Option<String>,
        up_to: StoredPosition,
    ) -> Result<usize, StorageError> {
        self.check_writable()?;
        if self
            .index
            .expirable(&actor, run_id.as_deref(), up_to)
            .is_empty()
        {
            return Ok(0);
        }
        let line = JournalLine::Expire {
            actor: actor.clone(),
            run_id: run_id.clone(),
            up_to,
        };
        self.write_line(&line).await?;
        Ok(self.index.expire(&actor, run_id.as_deref(), up_to))
    }
}

fn task_failed(e: tokio::task::JoinError) -> StorageError {
    StorageError::Backend(format!("journal write task failed: {e}"))
}

/// Replay journal bytes into an index.
fn rebuild(bytes: &[u8]) -> Result<Replayed, StorageError> {
    let mut index = Index::default();
    let mut offset = 0usize;
    let mut line_no = 0usize;
    let mut unterminated = false;

    while offset < bytes.len() {
        line_no += 1;
        let rest = &bytes[offset..];
        let (line, consumed, terminated) = match rest.iter().position(|&b| b == b'\n') {
            Some(i) => (&rest[..i], i + 1, true),
            None => (rest, rest.len(), false),
        };
        if line.iter().all(u8::is_ascii_whitespace) {
            offset += consumed;
            continue;
        }
        match serde_json::from_slice::<JournalLine>(line) {
            Ok(JournalLine::Append(stored)) => {
                index.insert(stored.position, stored.record, stored.annotations);
            }
            Ok(JournalLine::Expire {
                actor,
                run_id,
                up_to,
            }) => {
                index.expire(&actor, run_id.as_deref(), up_to);
            }
            Err(_) if !terminated => break,
            Err(e) => {
                return Err(StorageError::Corrupt {
                    line: line_no,
                    reason: e.to_string(),
                })
            }
        }
        unterminated = !terminated;
        offset += consumed;
    }

    Ok(Replayed {
        index,
        good_len: offset as u64,
        unterminated,
    })
}

#[async_trait]
impl ReplayStore for JournalStore {
    async fn append(
        &self,
        record: DecisionRecord,
        annotations: Annotations,
    ) -> Result<AppendOutcome, StorageError> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut guard = inner.lock().await;
            guard.append(record, annotations).await
        })
        .await
        .map_err(task_failed)?
    }

    async fn expire_front(
        &self,
        actor: &str,
        run_id: Option<&str>,
        up_to: StoredPosition,
    ) -> Result<usize, StorageError> {
        let inner = Arc::clone(&self.inner);
        let actor = actor.to_string();
        let run_id = run_id.map(str::to_string);
        tokio::spawn(async move {
            let mut guard = inner.lock().await;
            guard.expire(actor, run_id, up_to).await
        })
        .await
        .map_err(task_failed)?
    }

    async fn read(&self, query: &ReadQuery) -> Result<ReplayPage, StorageError> {
        Ok(self.inner.lock().await.index.read(query))
    }

    async fn get(&self, position: StoredPosition) -> Result<Option<StoredRecord>, StorageError> {
        Ok(self.inner.lock().await.index.get(position))
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<StoredPosition>, StorageError> {
        Ok(self.inner.lock().await.index.find_by_id(id))
    }

    async fn find_by_hash(&self, entry_hash: &str) -> Result<Option<StoredPosition>, StorageError> {
        Ok(self.inner.lock().await.index.find_by_hash(entry_hash))
    }

    async fn find_by_seq(
        &self,
        actor: &str,
        run_id: &str,
        seq: u64,
    ) -> Result<Option<StoredPosition>, StorageError> {
        Ok(self.inner.lock().await.index.find_by_seq(actor, run_id, seq))
    }

    async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.inner.lock().await.index.len())
    }
}
