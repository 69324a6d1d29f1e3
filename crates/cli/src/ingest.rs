use std::path::Path;
use std::sync::Arc;

use declog_core::{IngestOptions, IngestOutcome, Ingestor};
use declog_storage::JournalStore;
use serde_json::json;

use crate::config::CliConfig;
use crate::OutputFormat;

/// Per-run tallies.
#[derive(Debug, Default)]
pub struct Summary {
    pub accepted: usize,
    pub duplicate: usize,
    pub out_of_order: usize,
    pub rejected: usize,
}

impl Summary {
    fn count(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Accepted(_) => self.accepted += 1,
            IngestOutcome::Duplicate { .. } => self.duplicate += 1,
            IngestOutcome::OutOfOrder { .. } => self.out_of_order += 1,
            IngestOutcome::Rejected(_) => self.rejected += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.accepted + self.duplicate + self.out_of_order + self.rejected
    }

    /// Any record was refused.
    pub fn refused(&self) -> bool {
        self.out_of_order + self.rejected > 0
    }
}

/// Ingest every non-blank line of `input` into the journal at `store_path`.
///
/// Per-record outcomes are printed as they happen. A store failure stops
/// the run and is returned as `Err`; records already reported as accepted
/// are durable.
pub async fn cmd_ingest(
    input: &str,
    store_path: &Path,
    config: &CliConfig,
    backfill: bool,
    output: OutputFormat,
    quiet: bool,
) -> Result<Summary, String> {
    let store = JournalStore::open(store_path)
        .await
        .map_err(|e| format!("could not open store '{}': {}", store_path.display(), e))?;
    let keys = config.keyring()?;
    let ingestor = Ingestor::open(Arc::new(store), config.engine())
        .await
        .map_err(|e| e.to_string())?
        .with_keys(keys);

    let options = IngestOptions { backfill };
    let mut summary = Summary::default();
    for (idx, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = idx + 1;
        let outcome = ingestor
            .ingest_line(line, options)
            .await
            .map_err(|e| format!("line {}: {}", line_no, e))?;
        summary.count(&outcome);
        if !quiet {
            print_outcome(line_no, &outcome, output);
        }
    }

    if !quiet {
        match output {
            OutputFormat::Text => println!(
                "{} records: {} accepted, {} duplicate, {} out of order, {} rejected",
                summary.total(),
                summary.accepted,
                summary.duplicate,
                summary.out_of_order,
                summary.rejected
            ),
            OutputFormat::Json => println!(
                "{}",
                json!({"summary": {
                    "accepted": summary.accepted,
                    "duplicate": summary.duplicate,
                    "out_of_order": summary.out_of_order,
                    "rejected": summary.rejected,
                }})
            ),
        }
    }
    Ok(summary)
}

fn print_outcome(line_no: usize, outcome: &IngestOutcome, output: OutputFormat) {
    match output {
        OutputFormat::Json => {
            let mut value = match outcome {
                IngestOutcome::Accepted(a) => json!({
                    "position": a.position,
                    "trust_tier": a.trust_tier,
                    "out_of_order": a.out_of_order,
                    "signature_unverified": a.signature_unverified,
                    "events": a.events,
                }),
                IngestOutcome::Duplicate { position } => json!({"position": position}),
                IngestOutcome::OutOfOrder {
                    actor,
                    run_id,
                    seq,
                    last_seq,
                } => json!({"actor": actor, "run_id": run_id, "seq": seq, "last_seq": last_seq}),
                IngestOutcome::Rejected(reason) => {
                    json!({"reason": reason.code(), "message": reason.to_string()})
                }
            };
            value["line"] = json!(line_no);
            value["outcome"] = json!(outcome.label());
            println!("{}", value);
        }
        OutputFormat::Text => {
            match outcome {
                IngestOutcome::Accepted(a) => {
                    let mut flags = String::new();
                    if a.out_of_order {
                        flags.push_str(" [out-of-order backfill]");
                    }
                    if a.signature_unverified {
                        flags.push_str(" [signature unverified]");
                    }
                    println!(
                        "line {}: accepted at {} (tier {}){}",
                        line_no, a.position, a.trust_tier, flags
                    );
                    for event in &a.events {
                        println!("  {} ({})", event.kind, event.rationale);
                    }
                }
                IngestOutcome::Duplicate { position } => {
                    println!("line {}: duplicate of {}", line_no, position);
                }
                IngestOutcome::OutOfOrder { seq, last_seq, .. } => {
                    println!(
                        "line {}: out of order (seq {} <= last accepted {})",
                        line_no, seq, last_seq
                    );
                }
                IngestOutcome::Rejected(reason) => {
                    println!("line {}: rejected: {}", line_no, reason);
                }
            }
        }
    }
}
