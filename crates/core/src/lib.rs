//! declog-core: the decision-log ingestion engine.
//!
//! A candidate record flows through four stages, all driven by
//! [`Ingestor::ingest`]:
//!
//! 1. validation ([`declog_interchange::validate`])
//! 2. content-hash and signature checks ([`integrity`])
//! 3. per-actor ordering, dedup and out-of-order classification ([`ordering`]),
//!    consulting the actor's time-health state ([`health`])
//! 4. durable append to a [`declog_storage::ReplayStore`]
//!
//! Per-record failures are classifications ([`IngestOutcome`]), never
//! errors; only a storage failure surfaces as [`IngestError`].

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod integrity;
pub mod ordering;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, OutOfOrderPolicy};
pub use engine::{Accepted, IngestOptions, IngestOutcome, Ingestor};
pub use error::{ConfigError, IngestError, IntegrityError, RejectReason};
pub use events::{EventSink, HealthEvent, HealthEventKind, MemorySink, TracingSink};
pub use health::{TimeHealthMonitor, TimeHealthState};
pub use integrity::{KeyLookup, Keyring};
pub use ordering::{replay_order, ActorTimeline, ReplayKey};
