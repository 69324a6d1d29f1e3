use std::future::Future;

use super::{high, make_anonymous_record, make_record, TestResult};
use crate::record::{AppendOutcome, StoredPosition};
use crate::ReplayStore;

pub(super) async fn run_dedup_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "dedup",
            "same_id_is_already_present",
            same_id_is_already_present(factory).await,
        ),
        TestResult::from_result(
            "dedup",
            "same_hash_without_id_is_already_present",
            same_hash_without_id_is_already_present(factory).await,
        ),
        TestResult::from_result(
            "dedup",
            "duplicate_does_not_consume_a_position",
            duplicate_does_not_consume_a_position(factory).await,
        ),
    ]
}

async fn same_id_is_already_present<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = factory().await;
    store
        .append(make_record("device:a", "r1", 1), high())
        .await
        .map_err(|e| format!("first append: {e}"))?;
    let again = store
        .append(make_record("device:a", "r1", 1), high())
        .await
        .map_err(|e| format!("second append: {e}"))?;
    if again != AppendOutcome::AlreadyPresent(StoredPosition(0)) {
        return Err(format!("expected AlreadyPresent(0), got {again:?}"));
    }
    let len = store.len().await.map_err(|e| format!("len: {e}"))?;
    if len != 1 {
        return Err(format!("duplicate changed len to {len}"));
    }
    Ok(())
}

async fn same_hash_without_id_is_already_present<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = factory().await;
    store
        .append(make_anonymous_record("device:b", "r1", 1), high())
        .await
        .map_err(|e| format!("first append: {e}"))?;
    let again = store
        .append(make_anonymous_record("device:b", "r1", 1), high())
        .await
        .map_err(|e| format!("second append: {e}"))?;
    if again != AppendOutcome::AlreadyPresent(StoredPosition(0)) {
        return Err(format!("expected AlreadyPresent(0), got {again:?}"));
    }
    Ok(())
}

async fn duplicate_does_not_consume_a_position<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = factory().await;
    let append = |seq| store.append(make_record("device:a", "r1", seq), high());
    append(1).await.map_err(|e| format!("append 1: {e}"))?;
    append(1).await.map_err(|e| format!("append 1 again: {e}"))?;
    let next = append(2).await.map_err(|e| format!("append 2: {e}"))?;
    if next != AppendOutcome::Appended(StoredPosition(1)) {
        return Err(format!("expected Appended(1) after a duplicate, got {next:?}"));
    }
    Ok(())
}
