use declog_interchange::ValidationError;
use declog_storage::StorageError;

/// Content-hash and signature failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    /// The record carries no `integrity.entry_hash`.
    #[error("record has no integrity.entry_hash")]
    MissingHash,

    /// The recomputed content hash differs from the claimed one.
    #[error("entry hash mismatch: record claims {expected}, content hashes to {actual}")]
    HashMismatch { expected: String, actual: String },

    /// The signature is malformed, the actor has no registered key, or the
    /// signature does not verify.
    #[error("bad signature: {reason}")]
    BadSignature { reason: String },

    /// The actor's class requires a signature and none was given.
    #[error("actor class '{class}' requires a signature")]
    MissingSignature { class: String },
}

/// Why a record was refused. Reported per record; ingestion continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("validation failed: {0}")]
    Validation(ValidationError),

    #[error("integrity check failed: {0}")]
    Integrity(IntegrityError),

    /// A lamport counter went backwards within an `(actor, run_id)` stream.
    #[error("lamport counter regressed from {previous} to {incoming}")]
    LogicalClockRegression { previous: u64, incoming: u64 },
}

impl RejectReason {
    /// Short machine-readable tag, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::Validation(_) => "validation",
            RejectReason::Integrity(IntegrityError::HashMismatch { .. }) => "hash_mismatch",
            RejectReason::Integrity(IntegrityError::MissingHash) => "missing_hash",
            RejectReason::Integrity(IntegrityError::BadSignature { .. }) => "bad_signature",
            RejectReason::Integrity(IntegrityError::MissingSignature { .. }) => "missing_signature",
            RejectReason::LogicalClockRegression { .. } => "lamport_regression",
        }
    }

    /// Integrity failures are routed to audit/alerting as well as logged.
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, RejectReason::Integrity(_))
    }
}

/// Halt condition for one ingest attempt. The record was not accepted and
/// the caller must retry.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("time_health.high_threshold_s ({high}) must not exceed medium_threshold_s ({medium})")]
    ThresholdOrder { high: u64, medium: u64 },

    #[error("invalid key for actor '{actor}': {reason}")]
    InvalidKey { actor: String, reason: String },
}
