//! The ingestion pipeline.
//!
//! `validate -> verify -> order -> store` runs as one unit per record.
//! Validation and integrity checks are pure and run before any lock is
//! taken. Ordering and the store append run under the actor's lock, and
//! cursor, health state and events are only committed once the append is
//! durable. A store failure leaves no trace.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use declog_interchange::{DecisionRecord, TimestampSource, TrustTier};
use declog_storage::{
    Annotations, AppendOutcome, ReadQuery, ReplayStore, StorageError, StoredPosition, StoredRecord,
};
use serde::Serialize;
use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, OutOfOrderPolicy};
use crate::error::{IngestError, RejectReason};
use crate::events::{EventSink, HealthEvent, HealthEventKind, TracingSink};
use crate::health::{HealthInput, HealthSignal, Observation, TimeHealthMonitor, TimeHealthState};
use crate::integrity::{self, KeyLookup, Keyring, Verification};
use crate::ordering::{self, ActorTimeline, Admission, ReplayKey};

/// Per-call ingest options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOptions {
    /// The caller is replaying historical records. Together with
    /// [`OutOfOrderPolicy::AcceptAndFlag`], lets a seq at or below the
    /// cursor be accepted with a flag.
    pub backfill: bool,
}

impl IngestOptions {
    pub fn backfill() -> Self {
        IngestOptions { backfill: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Accepted {
    pub position: StoredPosition,
    pub replay_key: ReplayKey,
    pub trust_tier: TrustTier,
    pub out_of_order: bool,
    pub signature_unverified: bool,
    /// Health events this record caused, already emitted to the sink.
    pub events: Vec<HealthEvent>,
}

/// Classification of one ingest. Every record gets exactly one.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Accepted(Accepted),
    /// Already accepted (by id, or by entry hash when there is no id).
    Duplicate { position: StoredPosition },
    /// seq at or below the stream cursor; not appended.
    OutOfOrder {
        actor: String,
        run_id: String,
        seq: u64,
        last_seq: u64,
    },
    Rejected(RejectReason),
}

impl IngestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Accepted(_) => "accepted",
            IngestOutcome::Duplicate { .. } => "duplicate",
            IngestOutcome::OutOfOrder { .. } => "out_of_order",
            IngestOutcome::Rejected(_) => "rejected",
        }
    }

    pub fn position(&self) -> Option<StoredPosition> {
        match self {
            IngestOutcome::Accepted(a) => Some(a.position),
            IngestOutcome::Duplicate { position } => Some(*position),
            _ => None,
        }
    }

    /// Rejected or out of order.
    pub fn is_refused(&self) -> bool {
        matches!(
            self,
            IngestOutcome::Rejected(_) | IngestOutcome::OutOfOrder { .. }
        )
    }
}

#[derive(Debug, Default)]
struct ActorState {
    health: Option<TimeHealthState>,
    timelines: HashMap<String, ActorTimeline>,
}

type ActorSlot = Arc<tokio::sync::Mutex<ActorState>>;

pub struct Ingestor<S: ReplayStore> {
    store: Arc<S>,
    config: EngineConfig,
    monitor: TimeHealthMonitor,
    keys: Arc<dyn KeyLookup>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    actors: Mutex<HashMap<String, ActorSlot>>,
}

impl<S: ReplayStore> Ingestor<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        let monitor = TimeHealthMonitor::new(config.time_health.clone());
        Ingestor {
            store,
            config,
            monitor,
            keys: Arc::new(Keyring::new()),
            clock: Arc::new(SystemClock),
            sink: Arc::new(TracingSink),
            actors: Mutex::new(HashMap::new()),
        }
    }

    /// `new` followed by [`Ingestor::rebuild`].
    pub async fn open(store: Arc<S>, config: EngineConfig) -> Result<Self, IngestError> {
        let ingestor = Ingestor::new(store, config);
        ingestor.rebuild().await?;
        Ok(ingestor)
    }

    pub fn with_keys(mut self, keys: impl KeyLookup + 'static) -> Self {
        self.keys = Arc::new(keys);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Ingest one NDJSON line.
    pub async fn ingest_line(
        &self,
        line: &str,
        options: IngestOptions,
    ) -> Result<IngestOutcome, IngestError> {
        match declog_interchange::validate_line(line) {
            Ok(record) => self.ingest_record(record, options).await,
            Err(e) => Ok(self.reject(None, RejectReason::Validation(e))),
        }
    }

    /// Ingest one decoded candidate record.
    pub async fn ingest_value(
        &self,
        raw: &Value,
        options: IngestOptions,
    ) -> Result<IngestOutcome, IngestError> {
        match declog_interchange::validate(raw) {
            Ok(record) => self.ingest_record(record, options).await,
            Err(e) => Ok(self.reject(None, RejectReason::Validation(e))),
        }
    }

    /// Live ingest of one candidate.
    pub async fn ingest(&self, raw: &Value) -> Result<IngestOutcome, IngestError> {
        self.ingest_value(raw, IngestOptions::default()).await
    }

    /// Ingest an already-validated record.
    pub async fn ingest_record(
        &self,
        record: DecisionRecord,
        options: IngestOptions,
    ) -> Result<IngestOutcome, IngestError> {
        let verification =
            match integrity::verify(&record, self.keys.as_ref(), &self.config.signatures) {
                Ok(v) => v,
                Err(e) => return Ok(self.reject(Some(&record), RejectReason::Integrity(e))),
            };
        if let Verification::SignatureUnverified(e) = &verification {
            tracing::warn!(
                actor = %record.actor,
                seq = record.seq,
                error = %e,
                "accepting record with unverified signature"
            );
        }

        let slot = self.slot(&record.actor);
        let mut state = slot.lock().await;

        if let Some(position) = self.find_duplicate(&record).await? {
            tracing::debug!(actor = %record.actor, seq = record.seq, %position, "duplicate");
            return Ok(IngestOutcome::Duplicate { position });
        }

        let timeline = state.timelines.get(&record.run_id);
        let mut out_of_order = false;
        match ordering::admit(timeline, &record) {
            Admission::Fresh => {}
            Admission::Stale { last_seq } => {
                if !self.admits_backfill(&record, options).await? {
                    return Ok(self.out_of_order(&record, last_seq));
                }
                out_of_order = true;
            }
            Admission::LamportRegression { previous, incoming } => {
                return Ok(self.reject(
                    Some(&record),
                    RejectReason::LogicalClockRegression { previous, incoming },
                ));
            }
        }

        let now = self.clock.now_secs();
        let observation = Observation {
            source: record.timestamp.source,
            sync_age_s: record.timestamp.sync_age_secs(),
            observed_at: now,
        };
        let (health, signals) = self.monitor.on_record(state.health.as_ref(), observation);
        let tier = health.tier;
        let replay_key = ordering::replay_key(&record, tier);
        let signature_unverified = verification.is_signature_unverified();
        let annotations = Annotations {
            trust_tier: tier,
            out_of_order,
            signature_unverified,
        };

        let position = match self.store.append(record.clone(), annotations).await {
            Ok(AppendOutcome::Appended(position)) => position,
            Ok(AppendOutcome::AlreadyPresent(position)) => {
                return Ok(IngestOutcome::Duplicate { position });
            }
            Err(StorageError::SequenceConflict { .. }) => {
                let last_seq = timeline.map_or(record.seq, |t| t.last_seq);
                return Ok(self.out_of_order(&record, last_seq));
            }
            Err(e) => {
                tracing::error!(
                    actor = %record.actor,
                    seq = record.seq,
                    error = %e,
                    "append failed"
                );
                return Err(IngestError::Storage(e));
            }
        };

        // Durable: commit cursor, health and events.
        match state.timelines.get_mut(&record.run_id) {
            Some(t) => t.advance(&record, tier, position),
            None => {
                state.timelines.insert(
                    record.run_id.clone(),
                    ActorTimeline::start(&record, tier, position),
                );
            }
        }
        state.health = Some(health);
        let events = self.publish(&record.actor, signals, tier, Some(position), now);
        drop(state);

        tracing::debug!(
            actor = %record.actor,
            run_id = %record.run_id,
            seq = record.seq,
            %position,
            %tier,
            out_of_order,
            "accepted"
        );
        Ok(IngestOutcome::Accepted(Accepted {
            position,
            replay_key,
            trust_tier: tier,
            out_of_order,
            signature_unverified,
            events,
        }))
    }

    /// Re-evaluate every actor's health against the engine clock. May
    /// transition tiers (gate events) but never raises warnings.
    pub async fn tick(&self) -> Vec<HealthEvent> {
        let now = self.clock.now_secs();
        let mut all = Vec::new();
        for (actor, slot) in self.slots() {
            let mut state = slot.lock().await;
            let Some((health, signals)) = self
                .monitor
                .step(state.health.as_ref(), HealthInput::Tick { now })
            else {
                continue;
            };
            let tier = health.tier;
            state.health = Some(health);
            all.extend(self.publish(&actor, signals, tier, None, now));
        }
        all
    }

    /// Feed an out-of-band clock observation for `actor`. Unrecognised or
    /// missing sources count as `unknown`.
    pub async fn observe_heartbeat(
        &self,
        actor: &str,
        source: Option<&str>,
        sync_age_s: f64,
    ) -> Vec<HealthEvent> {
        let now = self.clock.now_secs();
        let observation = Observation {
            source: TimestampSource::parse_lenient(source),
            sync_age_s: sync_age_s.max(0.0),
            observed_at: now,
        };
        let slot = self.slot(actor);
        let mut state = slot.lock().await;
        let Some((health, signals)) = self
            .monitor
            .step(state.health.as_ref(), HealthInput::Heartbeat(observation))
        else {
            return Vec::new();
        };
        let tier = health.tier;
        state.health = Some(health);
        self.publish(actor, signals, tier, None, now)
    }

    pub async fn timeline(&self, actor: &str, run_id: &str) -> Option<ActorTimeline> {
        let slot = self.existing_slot(actor)?;
        let state = slot.lock().await;
        state.timelines.get(run_id).cloned()
    }

    pub async fn health(&self, actor: &str) -> Option<TimeHealthState> {
        let slot = self.existing_slot(actor)?;
        let state = slot.lock().await;
        state.health.clone()
    }

    /// Every stream cursor, sorted by `(actor, run_id)`.
    pub async fn timelines(&self) -> Vec<ActorTimeline> {
        let mut out = Vec::new();
        for (_, slot) in self.slots() {
            let state = slot.lock().await;
            out.extend(state.timelines.values().cloned());
        }
        out.sort_by(|a, b| (&a.actor, &a.run_id).cmp(&(&b.actor, &b.run_id)));
        out
    }

    /// Rebuild cursors and health from the store in commit order. No events
    /// are emitted. Returns the number of records folded in.
    pub async fn rebuild(&self) -> Result<usize, IngestError> {
        let mut rebuilt: HashMap<String, ActorState> = HashMap::new();
        let now = self.clock.now_secs();
        let mut replay = self.store.replay(ReadQuery::all());
        let mut count = 0usize;
        while let Some(stored) = replay.next().await? {
            let record = &stored.record;
            let state = rebuilt.entry(record.actor.clone()).or_default();
            let tier = stored.annotations.trust_tier;
            match state.timelines.get_mut(&record.run_id) {
                Some(t) => t.advance(record, tier, stored.position),
                None => {
                    state.timelines.insert(
                        record.run_id.clone(),
                        ActorTimeline::start(record, tier, stored.position),
                    );
                }
            }
            let observation = Observation {
                source: record.timestamp.source,
                sync_age_s: record.timestamp.sync_age_secs(),
                observed_at: now,
            };
            let (health, _) = self.monitor.on_record(state.health.as_ref(), observation);
            state.health = Some(health);
            count += 1;
        }

        let mut actors = self.actors.lock().unwrap_or_else(|e| e.into_inner());
        *actors = rebuilt
            .into_iter()
            .map(|(actor, state)| (actor, Arc::new(tokio::sync::Mutex::new(state))))
            .collect();
        tracing::info!(records = count, actors = actors.len(), "rebuilt ingest state from store");
        Ok(count)
    }

    /// Stored records matching `query`, in merged replay order.
    pub async fn merged_replay(&self, query: ReadQuery) -> Result<Vec<StoredRecord>, IngestError> {
        let records = self.store.replay(query).collect_all().await?;
        Ok(ordering::replay_order(records))
    }

    async fn find_duplicate(
        &self,
        record: &DecisionRecord,
    ) -> Result<Option<StoredPosition>, StorageError> {
        match (&record.id, record.entry_hash()) {
            (Some(id), _) => self.store.find_by_id(id).await,
            (None, Some(hash)) => self.store.find_by_hash(hash).await,
            (None, None) => Ok(None),
        }
    }

    async fn admits_backfill(
        &self,
        record: &DecisionRecord,
        options: IngestOptions,
    ) -> Result<bool, StorageError> {
        if !options.backfill
            || self.config.ordering.out_of_order != OutOfOrderPolicy::AcceptAndFlag
        {
            return Ok(false);
        }
        let taken = self
            .store
            .find_by_seq(&record.actor, &record.run_id, record.seq)
            .await?;
        Ok(taken.is_none())
    }

    fn publish(
        &self,
        actor: &str,
        signals: Vec<HealthSignal>,
        tier: TrustTier,
        position: Option<StoredPosition>,
        at_s: f64,
    ) -> Vec<HealthEvent> {
        let events: Vec<HealthEvent> = signals
            .into_iter()
            .map(|signal| match signal {
                HealthSignal::Gate { tier, rationale } => HealthEvent {
                    kind: HealthEventKind::gate(tier),
                    actor: actor.to_string(),
                    tier,
                    rationale,
                    position,
                    at_s,
                },
                HealthSignal::Warning { rationale } => HealthEvent {
                    kind: HealthEventKind::Warning,
                    actor: actor.to_string(),
                    tier,
                    rationale,
                    position,
                    at_s,
                },
            })
            .collect();
        for event in &events {
            self.sink.emit(event);
        }
        events
    }

    fn reject(&self, record: Option<&DecisionRecord>, reason: RejectReason) -> IngestOutcome {
        let actor = record.map(|r| r.actor.as_str()).unwrap_or("-");
        let seq = record.map(|r| r.seq);
        if reason.is_security_relevant() {
            tracing::warn!(
                target: "declog::audit",
                actor,
                ?seq,
                code = reason.code(),
                reason = %reason,
                "integrity failure"
            );
        } else {
            tracing::warn!(actor, ?seq, code = reason.code(), reason = %reason, "record rejected");
        }
        IngestOutcome::Rejected(reason)
    }

    fn out_of_order(&self, record: &DecisionRecord, last_seq: u64) -> IngestOutcome {
        tracing::warn!(
            actor = %record.actor,
            run_id = %record.run_id,
            seq = record.seq,
            last_seq,
            "out-of-order record"
        );
        IngestOutcome::OutOfOrder {
            actor: record.actor.clone(),
            run_id: record.run_id.clone(),
            seq: record.seq,
            last_seq,
        }
    }

    fn slot(&self, actor: &str) -> ActorSlot {
        let mut actors = self.actors.lock().unwrap_or_else(|e| e.into_inner());
        actors.entry(actor.to_string()).or_default().clone()
    }

    fn existing_slot(&self, actor: &str) -> Option<ActorSlot> {
        let actors = self.actors.lock().unwrap_or_else(|e| e.into_inner());
        actors.get(actor).cloned()
    }

    fn slots(&self) -> Vec<(String, ActorSlot)> {
        let actors = self.actors.lock().unwrap_or_else(|e| e.into_inner());
        let mut slots: Vec<(String, ActorSlot)> =
            actors.iter().map(|(a, s)| (a.clone(), s.clone())).collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }
}
