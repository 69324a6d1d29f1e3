//! End-to-end ingestion scenarios against real stores.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use declog_core::integrity::{self, Keyring};
use async_trait::async_trait;
use declog_core::{
    EngineConfig, HealthEventKind, IngestError, IngestOptions, IngestOutcome, Ingestor,
    IntegrityError, ManualClock, MemorySink, OutOfOrderPolicy, RejectReason,
};
use declog_interchange::{DecisionRecord, TrustTier};
use declog_storage::{
    Annotations, AppendOutcome, JournalStore, MemoryStore, ReadQuery, ReplayPage, ReplayStore,
    StorageError, StoredPosition, StoredRecord,
};
use ed25519_dalek::SigningKey;
use serde_json::{json, Value};

struct Draft {
    actor: &'static str,
    run: &'static str,
    seq: u64,
    source: &'static str,
    age: u64,
    id: bool,
    extra: Value,
}

fn draft(seq: u64) -> Draft {
    Draft {
        actor: "device:a",
        run: "r1",
        seq,
        source: "ntp",
        age: 10,
        id: true,
        extra: json!({}),
    }
}

impl Draft {
    fn source(mut self, source: &'static str) -> Self {
        self.source = source;
        self
    }

    fn actor(mut self, actor: &'static str) -> Self {
        self.actor = actor;
        self
    }

    fn anonymous(mut self) -> Self {
        self.id = false;
        self
    }

    fn with(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }

    fn unsealed(&self) -> DecisionRecord {
        let mut raw = json!({
            "actor": self.actor,
            "intent_id": format!("intent-{}", self.seq),
            "action": "valve.position.set",
            "rationale": "flow above setpoint",
            "seq": self.seq,
            "run_id": self.run,
            "timestamp": {
                "value": 1_740_830_400u64 + self.seq,
                "source": self.source,
                "sync_age_s": self.age
            },
        });
        if self.id {
            raw["id"] = json!(format!("{}/{}/{}", self.actor, self.run, self.seq));
        }
        if let Some(extra) = self.extra.as_object() {
            for (k, v) in extra {
                raw[k] = v.clone();
            }
        }
        declog_interchange::validate(&raw).unwrap()
    }

    fn sealed(&self) -> Value {
        let mut record = self.unsealed();
        integrity::seal(&mut record);
        record.to_value()
    }

    fn signed(&self, key: &SigningKey) -> Value {
        let mut record = self.unsealed();
        integrity::sign(&mut record, key);
        record.to_value()
    }
}

struct Harness<S: ReplayStore> {
    ingestor: Ingestor<S>,
    sink: Arc<MemorySink>,
    clock: Arc<ManualClock>,
}

fn harness_with(config: EngineConfig) -> Harness<MemoryStore> {
    harness_on(Arc::new(MemoryStore::new()), config)
}

fn harness() -> Harness<MemoryStore> {
    harness_with(EngineConfig::default())
}

fn harness_on<S: ReplayStore>(store: Arc<S>, config: EngineConfig) -> Harness<S> {
    let sink = Arc::new(MemorySink::new());
    let clock = Arc::new(ManualClock::at_secs(1_740_830_400));
    let ingestor = Ingestor::new(store, config)
        .with_clock(clock.clone())
        .with_sink(sink.clone());
    Harness {
        ingestor,
        sink,
        clock,
    }
}

fn accepted(outcome: &IngestOutcome) -> &declog_core::Accepted {
    match outcome {
        IngestOutcome::Accepted(a) => a,
        other => panic!("expected accepted, got {:?}", other),
    }
}

#[tokio::test]
async fn scenario_a_healthy_stream() {
    let h = harness();
    for seq in 1..=5 {
        let outcome = h.ingestor.ingest(&draft(seq).sealed()).await.unwrap();
        assert_eq!(accepted(&outcome).trust_tier, TrustTier::High);
    }

    let timeline = h.ingestor.timeline("device:a", "r1").await.unwrap();
    assert_eq!(timeline.last_seq, 5);
    assert_eq!(timeline.accepted, 5);
    assert_eq!(h.ingestor.health("device:a").await.unwrap().tier, TrustTier::High);
    assert_eq!(h.sink.count(HealthEventKind::Warning), 0);
    assert_eq!(h.sink.count(HealthEventKind::TrustHigh), 1);
    assert_eq!(h.ingestor.store().len().await.unwrap(), 5);
}

#[tokio::test]
async fn scenario_b_ntp_then_rtc_warns_once() {
    let h = harness();
    h.ingestor.ingest(&draft(1).sealed()).await.unwrap();
    let second = h.ingestor.ingest(&draft(2).source("rtc").sealed()).await.unwrap();

    let a = accepted(&second);
    assert_eq!(a.trust_tier, TrustTier::Low);
    let kinds: Vec<HealthEventKind> = a.events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![HealthEventKind::TrustLow, HealthEventKind::Warning]);
    assert_eq!(a.events[0].rationale, "source=rtc");

    h.ingestor.ingest(&draft(3).source("rtc").sealed()).await.unwrap();
    assert_eq!(h.sink.count(HealthEventKind::Warning), 1);
}

#[tokio::test]
async fn scenario_c_out_of_order_rejected_by_default() {
    let h = harness();
    accepted(&h.ingestor.ingest(&draft(3).sealed()).await.unwrap());
    let outcome = h.ingestor.ingest(&draft(2).sealed()).await.unwrap();
    assert_eq!(
        outcome,
        IngestOutcome::OutOfOrder {
            actor: "device:a".into(),
            run_id: "r1".into(),
            seq: 2,
            last_seq: 3
        }
    );
    assert_eq!(h.ingestor.store().len().await.unwrap(), 1);
    assert_eq!(
        h.ingestor
            .store()
            .find_by_seq("device:a", "r1", 2)
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn scenario_d_duplicate_is_idempotent() {
    let h = harness();
    let record = draft(1).sealed();
    let first = h.ingestor.ingest(&record).await.unwrap();
    let events_before = h.sink.events().len();
    let cursor_before = h.ingestor.timeline("device:a", "r1").await;

    let second = h.ingestor.ingest(&record).await.unwrap();
    assert_eq!(
        second,
        IngestOutcome::Duplicate {
            position: accepted(&first).position
        }
    );
    assert_eq!(h.ingestor.store().len().await.unwrap(), 1);
    assert_eq!(h.sink.events().len(), events_before);
    assert_eq!(h.ingestor.timeline("device:a", "r1").await, cursor_before);
}

#[tokio::test]
async fn anonymous_duplicate_detected_by_hash() {
    let h = harness();
    let record = draft(1).anonymous().sealed();
    h.ingestor.ingest(&record).await.unwrap();
    let again = h.ingestor.ingest(&record).await.unwrap();
    assert_eq!(again, IngestOutcome::Duplicate { position: StoredPosition(0) });
}

#[tokio::test]
async fn accepted_seq_strictly_increases_per_stream() {
    let h = harness();
    for seq in [1, 4, 2, 4, 7, 5, 9] {
        h.ingestor.ingest(&draft(seq).anonymous().sealed()).await.unwrap();
    }
    let stored = h
        .ingestor
        .store()
        .replay(ReadQuery::stream("device:a", "r1"))
        .collect_all()
        .await
        .unwrap();
    let seqs: Vec<u64> = stored.iter().map(|s| s.record.seq).collect();
    assert_eq!(seqs, vec![1, 4, 7, 9]);
}

#[tokio::test]
async fn hybrid_low_replays_in_seq_order_despite_timestamps() {
    let h = harness();
    let stamped = |seq: u64, at: u64| {
        draft(seq).source("rtc").with(json!({
            "temporal": {"mode": "hybrid", "lamport": seq},
            "timestamp": {"value": at, "source": "rtc"}
        }))
    };
    h.ingestor.ingest(&stamped(1, 1_900_000_000).sealed()).await.unwrap();
    h.ingestor.ingest(&stamped(2, 1_100_000_000).sealed()).await.unwrap();
    h.ingestor.ingest(&stamped(3, 1_500_000_000).sealed()).await.unwrap();

    let merged = h.ingestor.merged_replay(ReadQuery::all()).await.unwrap();
    let seqs: Vec<u64> = merged.iter().map(|s| s.record.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert!(merged.iter().all(|s| s.annotations.trust_tier == TrustTier::Low));
}

#[tokio::test]
async fn hash_mismatch_rejected_even_when_signed() {
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    let mut keys = Keyring::new();
    keys.insert("device:a", key.verifying_key());
    let h = harness();
    let ingestor = h.ingestor.with_keys(keys);

    let mut record = draft(1).signed(&key);
    record["action"] = json!("valve.position.override");
    let outcome = ingestor.ingest(&record).await.unwrap();
    assert!(matches!(
        outcome,
        IngestOutcome::Rejected(RejectReason::Integrity(IntegrityError::HashMismatch { .. }))
    ));
    assert_eq!(ingestor.store().len().await.unwrap(), 0);
    assert!(h.sink.events().is_empty());
}

#[tokio::test]
async fn bad_signature_flagged_unless_mandatory() {
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    let other = SigningKey::generate(&mut rand::rngs::OsRng);
    let mut keys = Keyring::new();
    keys.insert("device:a", other.verifying_key());
    keys.insert("payment:p", other.verifying_key());

    let mut config = EngineConfig::default();
    config.signatures.mandatory_classes.insert("payment".into());
    let h = harness_with(config);
    let ingestor = h.ingestor.with_keys(keys);

    let outcome = ingestor.ingest(&draft(1).signed(&key)).await.unwrap();
    assert!(accepted(&outcome).signature_unverified);
    let stored = ingestor.store().get(StoredPosition(0)).await.unwrap().unwrap();
    assert!(stored.annotations.signature_unverified);

    let outcome = ingestor
        .ingest(&draft(1).actor("payment:p").signed(&key))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        IngestOutcome::Rejected(RejectReason::Integrity(IntegrityError::BadSignature { .. }))
    ));

    let outcome = ingestor
        .ingest(&draft(2).actor("payment:p").sealed())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        IngestOutcome::Rejected(RejectReason::Integrity(IntegrityError::MissingSignature { .. }))
    ));
}

#[tokio::test]
async fn valid_signature_accepted_for_mandatory_class() {
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    let mut keys = Keyring::new();
    keys.insert("payment:p", key.verifying_key());
    let mut config = EngineConfig::default();
    config.signatures.mandatory_classes.insert("payment".into());
    let ingestor = harness_with(config).ingestor.with_keys(keys);

    let outcome = ingestor
        .ingest(&draft(1).actor("payment:p").signed(&key))
        .await
        .unwrap();
    assert!(!accepted(&outcome).signature_unverified);
}

#[tokio::test]
async fn gate_events_are_edge_triggered() {
    let h = harness();
    for seq in 1..=10 {
        h.ingestor.ingest(&draft(seq).sealed()).await.unwrap();
    }
    assert_eq!(h.sink.count(HealthEventKind::TrustHigh), 1);
    assert_eq!(h.sink.events().len(), 1);
    assert_eq!(h.sink.events()[0].position, Some(StoredPosition(0)));
}

#[tokio::test]
async fn lamport_regression_rejected() {
    let h = harness();
    let lamport = |seq, n| draft(seq).with(json!({"temporal": {"mode": "lamport", "lamport": n}}));
    h.ingestor.ingest(&lamport(1, 10).sealed()).await.unwrap();
    let outcome = h.ingestor.ingest(&lamport(2, 7).sealed()).await.unwrap();
    assert_eq!(
        outcome,
        IngestOutcome::Rejected(RejectReason::LogicalClockRegression {
            previous: 10,
            incoming: 7
        })
    );
    accepted(&h.ingestor.ingest(&lamport(3, 11).sealed()).await.unwrap());
}

#[tokio::test]
async fn backfill_needs_policy_and_opt_in() {
    let mut config = EngineConfig::default();
    config.ordering.out_of_order = OutOfOrderPolicy::AcceptAndFlag;
    let h = harness_with(config);
    h.ingestor.ingest(&draft(1).sealed()).await.unwrap();
    h.ingestor.ingest(&draft(5).sealed()).await.unwrap();

    // Live ingest is still refused.
    let live = h.ingestor.ingest(&draft(3).sealed()).await.unwrap();
    assert!(matches!(live, IngestOutcome::OutOfOrder { last_seq: 5, .. }));

    let backfilled = h
        .ingestor
        .ingest_value(&draft(3).sealed(), IngestOptions::backfill())
        .await
        .unwrap();
    assert!(accepted(&backfilled).out_of_order);
    assert_eq!(h.ingestor.timeline("device:a", "r1").await.unwrap().last_seq, 5);

    // An occupied seq is never re-accepted, even under backfill.
    let clash = h
        .ingestor
        .ingest_value(
            &draft(5)
                .anonymous()
                .with(json!({"rationale": "replayed"}))
                .sealed(),
            IngestOptions::backfill(),
        )
        .await
        .unwrap();
    assert!(matches!(clash, IngestOutcome::OutOfOrder { seq: 5, .. }));
}

#[tokio::test]
async fn backfill_ignored_under_reject_policy() {
    let h = harness();
    h.ingestor.ingest(&draft(5).sealed()).await.unwrap();
    let outcome = h
        .ingestor
        .ingest_value(&draft(3).sealed(), IngestOptions::backfill())
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::OutOfOrder { .. }));
}

#[tokio::test]
async fn tick_degrades_and_next_record_warns() {
    let h = harness();
    h.ingestor.ingest(&draft(1).sealed()).await.unwrap();

    h.clock.advance(Duration::from_secs(1_000));
    let events = h.ingestor.tick().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, HealthEventKind::TrustMedium);
    assert_eq!(events[0].position, None);

    h.clock.advance(Duration::from_secs(5_000));
    let events = h.ingestor.tick().await;
    assert_eq!(events[0].kind, HealthEventKind::TrustLow);
    assert_eq!(h.sink.count(HealthEventKind::Warning), 0);

    let outcome = h.ingestor.ingest(&draft(2).source("unknown").sealed()).await.unwrap();
    let kinds: Vec<HealthEventKind> = accepted(&outcome).events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![HealthEventKind::Warning]);
}

#[tokio::test]
async fn streams_of_one_actor_share_health_but_not_cursors() {
    let h = harness();
    h.ingestor.ingest(&draft(1).sealed()).await.unwrap();
    let other_run = Draft { run: "r2", ..draft(1) };
    accepted(&h.ingestor.ingest(&other_run.sealed()).await.unwrap());

    let timelines = h.ingestor.timelines().await;
    assert_eq!(timelines.len(), 2);
    assert_eq!(h.sink.count(HealthEventKind::TrustHigh), 1);
}

#[tokio::test]
async fn concurrent_actors_keep_per_actor_order() {
    let h = Arc::new(harness());
    let actors = ["device:c1", "device:c2", "device:c3", "device:c4"];
    let mut tasks = Vec::new();
    for actor in actors {
        let h = h.clone();
        tasks.push(tokio::spawn(async move {
            for seq in 1..=25 {
                let outcome = h.ingestor.ingest(&draft(seq).actor(actor).sealed()).await.unwrap();
                assert_eq!(outcome.label(), "accepted");
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(h.ingestor.store().len().await.unwrap(), 100);
    for actor in actors {
        let stored = h
            .ingestor
            .store()
            .replay(ReadQuery::actor(actor))
            .collect_all()
            .await
            .unwrap();
        let seqs: Vec<u64> = stored.iter().map(|s| s.record.seq).collect();
        assert_eq!(seqs, (1..=25).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn rebuild_restores_cursors_from_journal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("decisions.ndjson");
    {
        let store = Arc::new(JournalStore::open(&path).await.unwrap());
        let h = harness_on(store, EngineConfig::default());
        for seq in 1..=3 {
            h.ingestor.ingest(&draft(seq).sealed()).await.unwrap();
        }
        h.ingestor.ingest(&draft(4).source("rtc").sealed()).await.unwrap();
    }

    let store = Arc::new(JournalStore::open(&path).await.unwrap());
    let sink = Arc::new(MemorySink::new());
    let ingestor = Ingestor::open(store, EngineConfig::default())
        .await
        .unwrap()
        .with_sink(sink.clone());

    let timeline = ingestor.timeline("device:a", "r1").await.unwrap();
    assert_eq!(timeline.last_seq, 4);
    assert_eq!(timeline.accepted, 4);
    assert_eq!(timeline.trust_tier, TrustTier::Low);
    assert_eq!(ingestor.health("device:a").await.unwrap().tier, TrustTier::Low);

    // Cursor survived the restart; a stale seq is still refused and a
    // re-delivered record is still a duplicate.
    assert!(matches!(
        ingestor.ingest(&draft(2).anonymous().sealed()).await.unwrap(),
        IngestOutcome::OutOfOrder {
            seq: 2,
            last_seq: 4,
            ..
        }
    ));
    assert_eq!(
        ingestor.ingest(&draft(3).sealed()).await.unwrap(),
        IngestOutcome::Duplicate {
            position: StoredPosition(2)
        }
    );
    // Still LOW and already warned before the restart.
    ingestor.ingest(&draft(5).source("rtc").sealed()).await.unwrap();
    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn unknown_blocks_pass_through_storage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("decisions.ndjson");
    let record = draft(1)
        .with(json!({"x_energy": {"kwh": 1.25, "meter": "m-7"}, "v": 2}))
        .sealed();
    {
        let store = Arc::new(JournalStore::open(&path).await.unwrap());
        let h = harness_on(store, EngineConfig::default());
        accepted(&h.ingestor.ingest(&record).await.unwrap());
    }
    let store = JournalStore::open(&path).await.unwrap();
    let stored = store.get(StoredPosition(0)).await.unwrap().unwrap();
    assert_eq!(stored.record.to_value(), record);
    assert_eq!(stored.record.version(), 2);
}

#[tokio::test]
async fn model_lineage_records_are_ordinary() {
    let h = harness();
    let record = draft(1)
        .with(json!({
            "action": "model.version.promote",
            "model": {"id": "planner", "version": "2.4.1"}
        }))
        .sealed();
    accepted(&h.ingestor.ingest(&record).await.unwrap());
    let stale = draft(1)
        .anonymous()
        .with(json!({"model": {"id": "planner", "version": "2.4.2"}}))
        .sealed();
    assert!(matches!(
        h.ingestor.ingest(&stale).await.unwrap(),
        IngestOutcome::OutOfOrder { .. }
    ));
}

#[tokio::test]
async fn keyring_from_config_table() {
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    let mut table = BTreeMap::new();
    use base64::Engine as _;
    table.insert(
        "device:a".to_string(),
        base64::engine::general_purpose::STANDARD.encode(key.verifying_key().to_bytes()),
    );
    let keys = Keyring::from_base64(&table).unwrap();
    let ingestor = harness().ingestor.with_keys(keys);
    let outcome = ingestor.ingest(&draft(1).signed(&key)).await.unwrap();
    assert!(!accepted(&outcome).signature_unverified);
}

/// Memory store whose appends fail while `failing` is set.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReplayStore for FlakyStore {
    async fn append(
        &self,
        record: DecisionRecord,
        annotations: Annotations,
    ) -> Result<AppendOutcome, StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("disk full")));
        }
        self.inner.append(record, annotations).await
    }

    async fn expire_front(
        &self,
        actor: &str,
        run_id: Option<&str>,
        up_to: StoredPosition,
    ) -> Result<usize, StorageError> {
        self.inner.expire_front(actor, run_id, up_to).await
    }

    async fn read(&self, query: &ReadQuery) -> Result<ReplayPage, StorageError> {
        self.inner.read(query).await
    }

    async fn get(&self, position: StoredPosition) -> Result<Option<StoredRecord>, StorageError> {
        self.inner.get(position).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<StoredPosition>, StorageError> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_hash(&self, entry_hash: &str) -> Result<Option<StoredPosition>, StorageError> {
        self.inner.find_by_hash(entry_hash).await
    }

    async fn find_by_seq(
        &self,
        actor: &str,
        run_id: &str,
        seq: u64,
    ) -> Result<Option<StoredPosition>, StorageError> {
        self.inner.find_by_seq(actor, run_id, seq).await
    }

    async fn len(&self) -> Result<usize, StorageError> {
        self.inner.len().await
    }
}

#[tokio::test]
async fn failed_append_commits_nothing() {
    let store = Arc::new(FlakyStore::default());
    let h = harness_on(store.clone(), EngineConfig::default());
    h.ingestor.ingest(&draft(1).sealed()).await.unwrap();
    h.sink.take();

    // Would drop the actor to LOW and warn, but the append never lands.
    store.fail(true);
    let failed = h.ingestor.ingest(&draft(2).source("rtc").sealed()).await;
    assert!(matches!(
        failed,
        Err(IngestError::Storage(StorageError::Io(_)))
    ));
    let timeline = h.ingestor.timeline("device:a", "r1").await.unwrap();
    assert_eq!(timeline.last_seq, 1);
    assert_eq!(timeline.accepted, 1);
    assert_eq!(h.ingestor.health("device:a").await.unwrap().tier, TrustTier::High);
    assert!(h.sink.events().is_empty());
    assert_eq!(store.len().await.unwrap(), 1);

    // The retry is a fresh ingest, not a duplicate or a stale seq.
    store.fail(false);
    let retried = h.ingestor.ingest(&draft(2).source("rtc").sealed()).await.unwrap();
    let a = accepted(&retried);
    assert_eq!(a.position, StoredPosition(1));
    assert_eq!(a.trust_tier, TrustTier::Low);
    assert_eq!(h.sink.count(HealthEventKind::TrustLow), 1);
    assert_eq!(h.sink.count(HealthEventKind::Warning), 1);
}
