use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use declog_core::{replay_order, ActorTimeline, Ingestor};
use declog_storage::{JournalStore, ReadQuery, ReplayStore, StoredPosition};
use serde_json::json;

use crate::config::CliConfig;
use crate::OutputFormat;

async fn open_store(path: &Path) -> Result<JournalStore, String> {
    if !path.exists() {
        return Err(format!("store '{}' does not exist", path.display()));
    }
    JournalStore::open(path)
        .await
        .map_err(|e| format!("could not open store '{}': {}", path.display(), e))
}

/// Print stored records as NDJSON, in commit order or merged replay order.
pub async fn cmd_replay(
    store_path: &Path,
    actor: Option<String>,
    run_id: Option<String>,
    after: Option<u64>,
    merged: bool,
) -> Result<usize, String> {
    let store = open_store(store_path).await?;
    let query = ReadQuery {
        actor,
        run_id,
        after: after.map(StoredPosition),
        limit: 0,
    };

    let mut count = 0usize;
    if merged {
        let records = store
            .replay(query)
            .collect_all()
            .await
            .map_err(|e| e.to_string())?;
        for stored in replay_order(records) {
            println!("{}", to_line(&stored)?);
            count += 1;
        }
    } else {
        let mut replay = store.replay(query);
        while let Some(stored) = replay.next().await.map_err(|e| e.to_string())? {
            println!("{}", to_line(&stored)?);
            count += 1;
        }
    }
    Ok(count)
}

fn to_line(stored: &declog_storage::StoredRecord) -> Result<String, String> {
    serde_json::to_string(stored).map_err(|e| format!("serialization error: {}", e))
}

/// Rebuild engine state from the store and print cursors and trust tiers.
pub async fn cmd_status(
    store_path: &Path,
    config: &CliConfig,
    output: OutputFormat,
) -> Result<(), String> {
    let store = Arc::new(open_store(store_path).await?);
    let records = store.len().await.map_err(|e| e.to_string())?;
    let ingestor = Ingestor::open(store, config.engine())
        .await
        .map_err(|e| e.to_string())?;

    let mut by_actor: BTreeMap<String, Vec<ActorTimeline>> = BTreeMap::new();
    for timeline in ingestor.timelines().await {
        by_actor.entry(timeline.actor.clone()).or_default().push(timeline);
    }

    match output {
        OutputFormat::Json => {
            let mut actors = Vec::new();
            for (actor, streams) in &by_actor {
                let health = ingestor.health(actor).await;
                actors.push(json!({
                    "actor": actor,
                    "trust_tier": health.as_ref().map(|h| h.tier),
                    "rationale": health.as_ref().map(|h| h.rationale.clone()),
                    "streams": streams,
                }));
            }
            println!("{}", json!({"records": records, "actors": actors}));
        }
        OutputFormat::Text => {
            println!("{} retained records, {} actors", records, by_actor.len());
            for (actor, streams) in &by_actor {
                match ingestor.health(actor).await {
                    Some(h) => println!("{}  tier={}  ({})", actor, h.tier, h.rationale),
                    None => println!("{}", actor),
                }
                for t in streams {
                    println!(
                        "  {}  last_seq={}  accepted={}  last_position={}",
                        t.run_id, t.last_seq, t.accepted, t.last_position
                    );
                }
            }
        }
    }
    Ok(())
}
