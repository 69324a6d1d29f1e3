use std::future::Future;

use super::{high, make_record, TestResult};
use crate::record::{ReadQuery, StoredPosition};
use crate::ReplayStore;

pub(super) async fn run_read_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "read",
            "read_all_in_commit_order",
            read_all_in_commit_order(factory).await,
        ),
        TestResult::from_result(
            "read",
            "read_filters_by_actor_and_run",
            read_filters_by_actor_and_run(factory).await,
        ),
        TestResult::from_result(
            "read",
            "after_is_exclusive",
            after_is_exclusive(factory).await,
        ),
        TestResult::from_result(
            "read",
            "paging_reports_resume_point",
            paging_reports_resume_point(factory).await,
        ),
        TestResult::from_result(
            "read",
            "replay_resumes_from_observed_position",
            replay_resumes_from_observed_position(factory).await,
        ),
    ]
}

/// Appends a(r1) 1, b(r1) 1, a(r2) 1, a(r1) 2, b(r1) 2 at positions 0..=4.
async fn seeded<S, F, Fut>(factory: &F) -> Result<S, String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = factory().await;
    for (actor, run, seq) in [
        ("device:a", "r1", 1),
        ("device:b", "r1", 1),
        ("device:a", "r2", 1),
        ("device:a", "r1", 2),
        ("device:b", "r1", 2),
    ] {
        store
            .append(make_record(actor, run, seq), high())
            .await
            .map_err(|e| format!("seed {actor}/{run}/{seq}: {e}"))?;
    }
    Ok(store)
}

fn positions(records: &[crate::StoredRecord]) -> Vec<u64> {
    records.iter().map(|s| s.position.get()).collect()
}

async fn read_all_in_commit_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    let page = store
        .read(&ReadQuery::all())
        .await
        .map_err(|e| format!("read: {e}"))?;
    if positions(&page.records) != vec![0, 1, 2, 3, 4] {
        return Err(format!("unexpected order {:?}", positions(&page.records)));
    }
    if page.next.is_some() {
        return Err("unlimited read must be exhausted".to_string());
    }
    Ok(())
}

async fn read_filters_by_actor_and_run<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    let actor = store
        .read(&ReadQuery::actor("device:a"))
        .await
        .map_err(|e| format!("read actor: {e}"))?;
    if positions(&actor.records) != vec![0, 2, 3] {
        return Err(format!("actor filter gave {:?}", positions(&actor.records)));
    }
    let stream = store
        .read(&ReadQuery::stream("device:a", "r1"))
        .await
        .map_err(|e| format!("read stream: {e}"))?;
    if positions(&stream.records) != vec![0, 3] {
        return Err(format!("stream filter gave {:?}", positions(&stream.records)));
    }
    Ok(())
}

async fn after_is_exclusive<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    let page = store
        .read(&ReadQuery::all().after(StoredPosition(2)))
        .await
        .map_err(|e| format!("read: {e}"))?;
    if positions(&page.records) != vec![3, 4] {
        return Err(format!("after(2) gave {:?}", positions(&page.records)));
    }
    Ok(())
}

async fn paging_reports_resume_point<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    let first = store
        .read(&ReadQuery::all().limit(2))
        .await
        .map_err(|e| format!("read page 1: {e}"))?;
    if positions(&first.records) != vec![0, 1] || first.next != Some(StoredPosition(1)) {
        return Err(format!(
            "page 1: {:?} next {:?}",
            positions(&first.records),
            first.next
        ));
    }
    let resume = first.next.ok_or("page 1 had no resume point")?;
    let second = store
        .read(&ReadQuery::all().after(resume).limit(3))
        .await
        .map_err(|e| format!("read page 2: {e}"))?;
    if positions(&second.records) != vec![2, 3, 4] {
        return Err(format!("page 2: {:?}", positions(&second.records)));
    }
    if second.next.is_some() {
        // A full final page may or may not report a resume point; reading
        // from it must then return nothing.
        let third = store
            .read(&ReadQuery::all().after(StoredPosition(4)))
            .await
            .map_err(|e| format!("read page 3: {e}"))?;
        if !third.records.is_empty() {
            return Err("read past the end returned records".to_string());
        }
    }
    Ok(())
}

async fn replay_resumes_from_observed_position<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = seeded(factory).await?;
    let mut replay = store.replay(ReadQuery::all().limit(2));
    let mut seen = Vec::new();
    for _ in 0..3 {
        let stored = replay
            .next()
            .await
            .map_err(|e| format!("next: {e}"))?
            .ok_or("replay ended early")?;
        seen.push(stored.position.get());
    }
    let checkpoint = replay.position().ok_or("no position after three records")?;
    drop(replay);

    let rest = store
        .replay(ReadQuery::all().after(checkpoint))
        .collect_all()
        .await
        .map_err(|e| format!("resume: {e}"))?;
    seen.extend(positions(&rest));
    if seen != vec![0, 1, 2, 3, 4] {
        return Err(format!("resumed replay saw {seen:?}"));
    }
    Ok(())
}
