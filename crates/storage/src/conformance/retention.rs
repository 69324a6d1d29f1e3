use std::future::Future;

use super::{high, make_record, TestResult};
use crate::record::{AppendOutcome, ReadQuery, StoredPosition};
use crate::ReplayStore;

pub(super) async fn run_retention_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "retention",
            "expire_drops_only_the_actor_prefix",
            expire_drops_only_the_actor_prefix(factory).await,
        ),
        TestResult::from_result(
            "retention",
            "expire_can_target_one_run",
            expire_can_target_one_run(factory).await,
        ),
        TestResult::from_result(
            "retention",
            "expired_record_still_deduplicates",
            expired_record_still_deduplicates(factory).await,
        ),
        TestResult::from_result(
            "retention",
            "positions_are_not_reused_after_expiry",
            positions_are_not_reused_after_expiry(factory).await,
        ),
    ]
}

async fn expire_drops_only_the_actor_prefix<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = factory().await;
    for (actor, seq) in [("device:a", 1), ("device:b", 1), ("device:a", 2), ("device:a", 3)] {
        store
            .append(make_record(actor, "r1", seq), high())
            .await
            .map_err(|e| format!("append: {e}"))?;
    }
    let dropped = store
        .expire_front("device:a", None, StoredPosition(2))
        .await
        .map_err(|e| format!("expire: {e}"))?;
    if dropped != 2 {
        return Err(format!("expected 2 dropped, got {dropped}"));
    }
    let left: Vec<(String, u64)> = store
        .read(&ReadQuery::all())
        .await
        .map_err(|e| format!("read: {e}"))?
        .records
        .into_iter()
        .map(|s| (s.record.actor, s.record.seq))
        .collect();
    let expected = vec![("device:b".to_string(), 1), ("device:a".to_string(), 3)];
    if left != expected {
        return Err(format!("expected {expected:?} retained, got {left:?}"));
    }
    Ok(())
}

async fn expire_can_target_one_run<S, F, Fut>(factory: &F) -> Result<(), String>
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
    store
        .append(make_record("device:a", "r2", 1), high())
        .await
        .map_err(|e| format!("append: {e}"))?;
    let dropped = store
        .expire_front("device:a", Some("r2"), StoredPosition(10))
        .await
        .map_err(|e| format!("expire: {e}"))?;
    if dropped != 1 {
        return Err(format!("expected 1 dropped, got {dropped}"));
    }
    if store
        .get(StoredPosition(0))
        .await
        .map_err(|e| format!("get: {e}"))?
        .is_none()
    {
        return Err("run r1 was expired by a run r2 expiry".to_string());
    }
    Ok(())
}

async fn expired_record_still_deduplicates<S, F, Fut>(factory: &F) -> Result<(), String>
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
    store
        .expire_front("device:a", None, StoredPosition(0))
        .await
        .map_err(|e| format!("expire: {e}"))?;
    let again = store
        .append(make_record("device:a", "r1", 1), high())
        .await
        .map_err(|e| format!("re-append: {e}"))?;
    if again != AppendOutcome::AlreadyPresent(StoredPosition(0)) {
        return Err(format!("expected AlreadyPresent(0), got {again:?}"));
    }
    Ok(())
}

async fn positions_are_not_reused_after_expiry<S, F, Fut>(factory: &F) -> Result<(), String>
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
    store
        .expire_front("device:a", None, StoredPosition(0))
        .await
        .map_err(|e| format!("expire: {e}"))?;
    let next = store
        .append(make_record("device:a", "r1", 2), high())
        .await
        .map_err(|e| format!("append: {e}"))?;
    if next != AppendOutcome::Appended(StoredPosition(1)) {
        return Err(format!("expected Appended(1), got {next:?}"));
    }
    Ok(())
}
