use std::future::Future;

use super::{high, make_record, TestResult};
use crate::record::{Annotations, AppendOutcome, StoredPosition};
use crate::{ReplayStore, StorageError};
use declog_interchange::TrustTier;

pub(super) async fn run_append_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "append",
            "positions_start_at_zero_and_increase",
            positions_start_at_zero_and_increase(factory).await,
        ),
        TestResult::from_result(
            "append",
            "record_reads_back_verbatim",
            record_reads_back_verbatim(factory).await,
        ),
        TestResult::from_result(
            "append",
            "annotations_are_kept",
            annotations_are_kept(factory).await,
        ),
        TestResult::from_result(
            "append",
            "sequence_conflict_is_refused",
            sequence_conflict_is_refused(factory).await,
        ),
        TestResult::from_result(
            "append",
            "lookups_find_appended_record",
            lookups_find_appended_record(factory).await,
        ),
    ]
}

async fn positions_start_at_zero_and_increase<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = factory().await;
    if !store.is_empty().await.map_err(|e| format!("is_empty: {e}"))? {
        return Err("fresh store is not empty".to_string());
    }
    for seq in 1..=3u64 {
        let outcome = store
            .append(make_record("device:a", "r1", seq), high())
            .await
            .map_err(|e| format!("append {seq}: {e}"))?;
        let expected = AppendOutcome::Appended(StoredPosition(seq - 1));
        if outcome != expected {
            return Err(format!("seq {seq}: expected {expected:?}, got {outcome:?}"));
        }
    }
    let len = store.len().await.map_err(|e| format!("len: {e}"))?;
    if len != 3 {
        return Err(format!("expected len 3, got {len}"));
    }
    Ok(())
}

async fn record_reads_back_verbatim<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = factory().await;
    let mut record = make_record("device:a", "r1", 1);
    record.extensions.insert(
        "future_block".to_string(),
        serde_json::json!({"nested": [1, 2, {"k": "v"}]}),
    );
    let pos = store
        .append(record.clone(), high())
        .await
        .map_err(|e| format!("append: {e}"))?
        .position();
    let stored = store
        .get(pos)
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("appended record not found")?;
    if stored.record != record {
        return Err(format!(
            "record changed in storage: {:?} vs {:?}",
            stored.record, record
        ));
    }
    Ok(())
}

async fn annotations_are_kept<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = factory().await;
    let annotations = Annotations {
        trust_tier: TrustTier::Low,
        out_of_order: true,
        signature_unverified: true,
    };
    let pos = store
        .append(make_record("device:a", "r1", 1), annotations.clone())
        .await
        .map_err(|e| format!("append: {e}"))?
        .position();
    let stored = store
        .get(pos)
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("appended record not found")?;
    if stored.annotations != annotations {
        return Err(format!(
            "expected annotations {annotations:?}, got {:?}",
            stored.annotations
        ));
    }
    Ok(())
}

async fn sequence_conflict_is_refused<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = factory().await;
    store
        .append(make_record("device:a", "r1", 1), high())
        .await
        .map_err(|e| format!("append: {e}"))?;

    let mut rival = make_record("device:a", "r1", 1);
    rival.id = Some("someone-else".to_string());
    rival.integrity = Some(declog_interchange::Integrity {
        entry_hash: Some("ff".repeat(32)),
        signature: None,
        extra: Default::default(),
    });
    match store.append(rival, high()).await {
        Err(StorageError::SequenceConflict { seq: 1, position: 0, .. }) => {}
        other => return Err(format!("expected SequenceConflict, got {other:?}")),
    }
    let len = store.len().await.map_err(|e| format!("len: {e}"))?;
    if len != 1 {
        return Err(format!("conflicting append changed len to {len}"));
    }
    Ok(())
}

async fn lookups_find_appended_record<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = factory().await;
    let record = make_record("device:a", "r1", 7);
    let hash = record.entry_hash().unwrap_or_default().to_string();
    let pos = store
        .append(record, high())
        .await
        .map_err(|e| format!("append: {e}"))?
        .position();

    let by_id = store
        .find_by_id("device:a/r1/7")
        .await
        .map_err(|e| format!("find_by_id: {e}"))?;
    let by_hash = store
        .find_by_hash(&format!("sha256:{}", hash.to_uppercase()))
        .await
        .map_err(|e| format!("find_by_hash: {e}"))?;
    let by_seq = store
        .find_by_seq("device:a", "r1", 7)
        .await
        .map_err(|e| format!("find_by_seq: {e}"))?;
    for (what, found) in [("id", by_id), ("hash", by_hash), ("seq", by_seq)] {
        if found != Some(pos) {
            return Err(format!("lookup by {what}: expected {pos:?}, got {found:?}"));
        }
    }
    let missing = store
        .find_by_seq("device:a", "r1", 8)
        .await
        .map_err(|e| format!("find_by_seq: {e}"))?;
    if missing.is_some() {
        return Err(format!("unexpected hit for seq 8: {missing:?}"));
    }
    Ok(())
}
