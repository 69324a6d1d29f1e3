//! Typed structs representing the decision record JSON shape.
//!
//! Numeric fields that a producer may write either as integers or as
//! fractions (`timestamp.value`, `timestamp.sync_age_s`) are stored as
//! `serde_json::Number` so that re-serialising a record reproduces the
//! producer's bytes exactly. The content hash depends on that.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::OffsetDateTime;

/// Schema version assumed when a record carries no `v` field.
pub const DEFAULT_SCHEMA_VERSION: u64 = 1;

/// Top-level keys with a typed home in [`DecisionRecord`]. Everything else
/// lands in the pass-through `extensions` map.
pub const KNOWN_FIELDS: &[&str] = &[
    "v",
    "id",
    "actor",
    "intent_id",
    "action",
    "rationale",
    "seq",
    "run_id",
    "correlation_id",
    "timestamp",
    "temporal",
    "result",
    "model",
    "artifact_hash",
    "integrity",
];

// ── Timestamp ───────────────────────────────────────────────────────

/// Where a producer's wall-clock value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampSource {
    Ntp,
    Gateway,
    Rtc,
    Server,
    Unknown,
}

impl TimestampSource {
    pub const ALL: [TimestampSource; 5] = [
        TimestampSource::Ntp,
        TimestampSource::Gateway,
        TimestampSource::Rtc,
        TimestampSource::Server,
        TimestampSource::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TimestampSource::Ntp => "ntp",
            TimestampSource::Gateway => "gateway",
            TimestampSource::Rtc => "rtc",
            TimestampSource::Server => "server",
            TimestampSource::Unknown => "unknown",
        }
    }

    /// Strict parse used by record validation.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|src| src.as_str() == s)
    }

    /// Lenient parse for collaborator-fed observations: anything missing or
    /// unrecognised is `Unknown`.
    pub fn parse_lenient(s: Option<&str>) -> Self {
        s.and_then(Self::parse).unwrap_or(TimestampSource::Unknown)
    }
}

impl fmt::Display for TimestampSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A wall-clock value as the producer sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimestampValue {
    /// ISO-8601 / RFC 3339 text.
    Text(String),
    /// Unix epoch seconds, integer or fractional.
    Epoch(Number),
}

impl TimestampValue {
    /// Nanoseconds since the Unix epoch, or `None` if the value does not
    /// parse.
    pub fn unix_nanos(&self) -> Option<i128> {
        match self {
            TimestampValue::Text(s) => OffsetDateTime::parse(s, &Rfc3339)
                .or_else(|_| OffsetDateTime::parse(s, &Iso8601::DEFAULT))
                .ok()
                .map(|dt| dt.unix_timestamp_nanos()),
            TimestampValue::Epoch(n) => {
                if let Some(secs) = n.as_u64() {
                    Some(i128::from(secs) * 1_000_000_000)
                } else {
                    let secs = n.as_f64()?;
                    if !secs.is_finite() || secs < 0.0 {
                        return None;
                    }
                    Some((secs * 1e9) as i128)
                }
            }
        }
    }
}

/// The `timestamp` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestamp {
    pub value: TimestampValue,
    pub source: TimestampSource,
    /// Producer-reported seconds since its last time synchronisation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_age_s: Option<Number>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Timestamp {
    /// Sync age in seconds; an absent age means the producer considers
    /// itself currently synchronised.
    pub fn sync_age_secs(&self) -> f64 {
        self.sync_age_s
            .as_ref()
            .and_then(|n| n.as_f64())
            .unwrap_or(0.0)
    }
}

// ── Temporal ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalMode {
    Monotonic,
    Lamport,
    Hybrid,
}

impl TemporalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TemporalMode::Monotonic => "monotonic",
            TemporalMode::Lamport => "lamport",
            TemporalMode::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monotonic" => Some(TemporalMode::Monotonic),
            "lamport" => Some(TemporalMode::Lamport),
            "hybrid" => Some(TemporalMode::Hybrid),
            _ => None,
        }
    }

    /// Lamport and hybrid streams must carry a logical counter.
    pub fn requires_counter(self) -> bool {
        matches!(self, TemporalMode::Lamport | TemporalMode::Hybrid)
    }
}

/// The `temporal` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Temporal {
    pub mode: TemporalMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lamport: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

// ── Result ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Executed,
    Aborted,
    Simulated,
    Skipped,
}

impl ResultStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "executed" => Some(ResultStatus::Executed),
            "aborted" => Some(ResultStatus::Aborted),
            "simulated" => Some(ResultStatus::Simulated),
            "skipped" => Some(ResultStatus::Skipped),
            _ => None,
        }
    }
}

/// What a record says happened. A record without a `result` block has an
/// `Unknown` outcome; it is never read as executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Reported(ResultStatus),
    Unknown,
}

/// The `result` block. Extra keys beside `status` are passed through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBlock {
    pub status: ResultStatus,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

// ── Model lineage ───────────────────────────────────────────────────

/// The `model` block carried by LLM-assisted decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRef {
    pub id: String,
    pub version: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

// ── Integrity ───────────────────────────────────────────────────────

/// The `integrity` block. Not part of the hashed content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Integrity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_hash: Option<String>,
    /// Base64 Ed25519 signature over the hex entry hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

// ── Trust tier ──────────────────────────────────────────────────────

/// Reliability classification of an actor's wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Low,
    Medium,
    High,
}

impl TrustTier {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustTier::High => "high",
            TrustTier::Medium => "medium",
            TrustTier::Low => "low",
        }
    }

    /// Wall-clock time may only act as a primary ordering key above LOW.
    pub fn trusts_wall_clock(self) -> bool {
        !matches!(self, TrustTier::Low)
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Record ──────────────────────────────────────────────────────────

/// The atomic unit: one decision made by one actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub actor: String,
    pub intent_id: String,
    pub action: String,
    pub rationale: String,
    pub seq: u64,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal: Option<Temporal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<Integrity>,
    /// Unknown top-level blocks, kept verbatim.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl DecisionRecord {
    pub fn version(&self) -> u64 {
        self.schema_version.unwrap_or(DEFAULT_SCHEMA_VERSION)
    }

    pub fn mode(&self) -> TemporalMode {
        self.temporal
            .as_ref()
            .map(|t| t.mode)
            .unwrap_or(TemporalMode::Monotonic)
    }

    pub fn lamport(&self) -> Option<u64> {
        self.temporal.as_ref().and_then(|t| t.lamport)
    }

    pub fn outcome(&self) -> Outcome {
        match &self.result {
            Some(block) => Outcome::Reported(block.status),
            None => Outcome::Unknown,
        }
    }

    pub fn entry_hash(&self) -> Option<&str> {
        self.integrity.as_ref().and_then(|i| i.entry_hash.as_deref())
    }

    /// Entry hash as an index key: `sha256:` prefix stripped, lowercased.
    pub fn normalized_entry_hash(&self) -> Option<String> {
        self.entry_hash().map(normalize_hash)
    }

    pub fn signature(&self) -> Option<&str> {
        self.integrity.as_ref().and_then(|i| i.signature.as_deref())
    }

    /// Actor class: the part of the actor identity before the first `:`.
    pub fn actor_class(&self) -> &str {
        actor_class(&self.actor)
    }

    /// Serialise to a JSON value mirroring the wire shape.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Strip an optional `sha256:` prefix and lowercase the hex digits.
pub fn normalize_hash(hash: &str) -> String {
    hash.strip_prefix("sha256:")
        .unwrap_or(hash)
        .to_ascii_lowercase()
}

/// `device:a` → `device`; an identity without `:` is its own class.
pub fn actor_class(actor: &str) -> &str {
    actor.split_once(':').map(|(class, _)| class).unwrap_or(actor)
}
