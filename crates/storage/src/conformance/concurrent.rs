use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use super::{high, make_record, TestResult};
use crate::record::{AppendOutcome, ReadQuery};
use crate::{ReplayStore, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 8;
/// Records appended by each task.
const PER_TASK: u64 = 12;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "parallel_actors_keep_per_actor_order",
            parallel_actors_keep_per_actor_order(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "racing_duplicates_append_exactly_once",
            racing_duplicates_append_exactly_once(factory).await,
        ),
    ]
}

// ── Parallel actors: every append lands, per-actor order preserved ───────────

/// N tasks, one per actor, each append PER_TASK records in seq order. All
/// positions must be distinct and each actor's records must read back in
/// seq order.
async fn parallel_actors_keep_per_actor_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = store.clone();
        handles.push(tokio::spawn(async move {
            let actor = format!("device:{i}");
            for seq in 1..=PER_TASK {
                s.append(make_record(&actor, "r1", seq), high()).await?;
            }
            Ok::<(), StorageError>(())
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        handle
            .await
            .map_err(|e| format!("task {i} panic: {e}"))?
            .map_err(|e| format!("task {i} failed: {e}"))?;
    }

    let all = store
        .read(&ReadQuery::all())
        .await
        .map_err(|e| format!("read: {e}"))?
        .records;
    let expected = N * PER_TASK as usize;
    if all.len() != expected {
        return Err(format!("expected {expected} records, got {}", all.len()));
    }
    let distinct: HashSet<u64> = all.iter().map(|s| s.position.get()).collect();
    if distinct.len() != expected {
        return Err("positions were reused".to_string());
    }

    let mut last_seq: HashMap<&str, u64> = HashMap::new();
    for stored in &all {
        let prev = last_seq.insert(&stored.record.actor, stored.record.seq);
        if let Some(prev) = prev {
            if stored.record.seq <= prev {
                return Err(format!(
                    "{}: seq {} committed after seq {}",
                    stored.record.actor, stored.record.seq, prev
                ));
            }
        }
    }
    Ok(())
}

// ── Racing duplicates: exactly one append wins ───────────────────────────────

/// N tasks append the identical record at once. Exactly one reports
/// Appended; the rest report AlreadyPresent at the same position.
async fn racing_duplicates_append_exactly_once<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = Arc::new(factory().await);

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = store.clone();
        handles.push(tokio::spawn(async move {
            s.append(make_record("device:dup", "r1", 1), high()).await
        }));
    }

    let mut appended = 0usize;
    let mut positions = HashSet::new();
    for handle in handles {
        let outcome = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
        if matches!(outcome, AppendOutcome::Appended(_)) {
            appended += 1;
        }
        positions.insert(outcome.position());
    }

    if appended != 1 {
        return Err(format!("expected exactly 1 append, got {appended}"));
    }
    if positions.len() != 1 {
        return Err(format!("duplicates reported different positions: {positions:?}"));
    }
    let len = store.len().await.map_err(|e| format!("len: {e}"))?;
    if len != 1 {
        return Err(format!("expected len 1, got {len}"));
    }
    Ok(())
}
