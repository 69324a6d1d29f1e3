//! Conformance test suite for `ReplayStore` implementations.
//!
//! This module provides a backend-agnostic test suite that any `ReplayStore`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Append**: positions start at 0, increase strictly, records read back verbatim
//! - **Dedup**: re-appending by id or by entry hash is a no-op returning the original position
//! - **Read**: filtering, exclusive resume points, paging, lazy replay
//! - **Retention**: front-only expiry, dedup keys surviving expiry
//! - **Concurrency**: parallel appends from many actors keep per-actor order
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty store for each test:
//!
//! ```ignore
//! use declog_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn memory_conformance() {
//!     let report = run_conformance_suite(|| async { MemoryStore::new() }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod append;
mod concurrent;
mod dedup;
mod read;
mod retention;

use std::fmt;
use std::future::Future;

use declog_interchange::{DecisionRecord, TrustTier};

use crate::record::Annotations;
use crate::ReplayStore;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "append", "dedup", "read").
    pub category: String,
    /// Test name (e.g. "positions_start_at_zero").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// store instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: ReplayStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(append::run_append_tests(&factory).await);
    results.extend(dedup::run_dedup_tests(&factory).await);
    results.extend(read::run_read_tests(&factory).await);
    results.extend(retention::run_retention_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

/// A valid record for `(actor, run_id, seq)` with a unique id and hash.
fn make_record(actor: &str, run_id: &str, seq: u64) -> DecisionRecord {
    let mut record = make_anonymous_record(actor, run_id, seq);
    record.id = Some(format!("{actor}/{run_id}/{seq}"));
    record
}

/// Like [`make_record`] but without an id, so dedup falls back to the hash.
fn make_anonymous_record(actor: &str, run_id: &str, seq: u64) -> DecisionRecord {
    let hash = fake_hash(&format!("{actor}/{run_id}/{seq}"));
    declog_interchange::validate(&serde_json::json!({
        "v": 1,
        "actor": actor,
        "intent_id": format!("intent-{seq}"),
        "action": "conformance.probe",
        "rationale": "conformance suite record",
        "seq": seq,
        "run_id": run_id,
        "timestamp": {"value": 1_740_830_400u64 + seq, "source": "ntp", "sync_age_s": 5},
        "temporal": {"mode": "monotonic"},
        "result": {"status": "simulated"},
        "integrity": {"entry_hash": hash}
    }))
    .unwrap_or_else(|e| panic!("conformance fixture is invalid: {e}"))
}

/// A stable 64-hex-digit stand-in for a content hash. Backends only index
/// the string; they never recompute it.
fn fake_hash(seed: &str) -> String {
    let mut acc: u64 = 0xcbf2_9ce4_8422_2325;
    for b in seed.bytes() {
        acc ^= u64::from(b);
        acc = acc.wrapping_mul(0x0100_0000_01b3);
    }
    format!("{acc:016x}").repeat(4)
}

fn high() -> Annotations {
    Annotations::new(TrustTier::High)
}
