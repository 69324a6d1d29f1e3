//! Synthetic time-health events and where they go.

use std::fmt;
use std::sync::Mutex;

use declog_interchange::TrustTier;
use declog_storage::StoredPosition;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HealthEventKind {
    #[serde(rename = "time.trust.high")]
    TrustHigh,
    #[serde(rename = "time.trust.medium")]
    TrustMedium,
    #[serde(rename = "time.trust.low")]
    TrustLow,
    #[serde(rename = "time.health.warning")]
    Warning,
}

impl HealthEventKind {
    pub fn gate(tier: TrustTier) -> Self {
        match tier {
            TrustTier::High => HealthEventKind::TrustHigh,
            TrustTier::Medium => HealthEventKind::TrustMedium,
            TrustTier::Low => HealthEventKind::TrustLow,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthEventKind::TrustHigh => "time.trust.high",
            HealthEventKind::TrustMedium => "time.trust.medium",
            HealthEventKind::TrustLow => "time.trust.low",
            HealthEventKind::Warning => "time.health.warning",
        }
    }

    pub fn is_warning(self) -> bool {
        self == HealthEventKind::Warning
    }
}

impl fmt::Display for HealthEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthEvent {
    pub kind: HealthEventKind,
    pub actor: String,
    pub tier: TrustTier,
    pub rationale: String,
    /// Replay position of the record that caused the event; `None` for
    /// tick or heartbeat transitions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<StoredPosition>,
    /// Engine clock reading, seconds since the epoch.
    pub at_s: f64,
}

/// Consumer of health events. Called under the actor's lock, in order.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &HealthEvent);
}

/// Logs every event. The default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &HealthEvent) {
        let position = event.position.map(|p| p.get());
        if event.kind.is_warning() {
            tracing::warn!(
                actor = %event.actor,
                tier = %event.tier,
                rationale = %event.rationale,
                ?position,
                "{}", event.kind
            );
        } else {
            tracing::info!(
                actor = %event.actor,
                tier = %event.tier,
                rationale = %event.rationale,
                ?position,
                "{}", event.kind
            );
        }
    }
}

/// Buffers events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<HealthEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    pub fn events(&self) -> Vec<HealthEvent> {
        self.lock().clone()
    }

    pub fn take(&self) -> Vec<HealthEvent> {
        std::mem::take(&mut *self.lock())
    }

    pub fn count(&self, kind: HealthEventKind) -> usize {
        self.lock().iter().filter(|e| e.kind == kind).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<HealthEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &HealthEvent) {
        self.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_dotted_kind() {
        let event = HealthEvent {
            kind: HealthEventKind::gate(TrustTier::Low),
            actor: "device:a".into(),
            tier: TrustTier::Low,
            rationale: "source=rtc".into(),
            position: Some(StoredPosition(4)),
            at_s: 1.5,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({
                "kind": "time.trust.low",
                "actor": "device:a",
                "tier": "low",
                "rationale": "source=rtc",
                "position": 4,
                "at_s": 1.5
            })
        );
    }

    #[test]
    fn memory_sink_counts_and_drains() {
        let sink = MemorySink::new();
        for kind in [
            HealthEventKind::TrustHigh,
            HealthEventKind::Warning,
            HealthEventKind::Warning,
        ] {
            sink.emit(&HealthEvent {
                kind,
                actor: "a".into(),
                tier: TrustTier::High,
                rationale: String::new(),
                position: None,
                at_s: 0.0,
            });
        }
        assert_eq!(sink.count(HealthEventKind::Warning), 2);
        assert_eq!(sink.take().len(), 3);
        assert!(sink.events().is_empty());
    }
}
