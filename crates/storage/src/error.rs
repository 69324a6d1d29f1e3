/// All errors that can be returned by a ReplayStore implementation.
///
/// Any of these means the record was NOT durably appended; the caller must
/// retry the ingest.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Reading or writing the underlying medium failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A journal line could not be decoded on open.
    #[error("corrupt journal at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    /// A different record already holds this `(actor, run_id, seq)`.
    #[error("sequence {seq} of {actor}/{run_id} is already stored at position {position}")]
    SequenceConflict {
        actor: String,
        run_id: String,
        seq: u64,
        position: u64,
    },

    /// Any other backend-specific failure (serialization, poisoned state, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}
