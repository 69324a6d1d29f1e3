//! Per-actor time-health state machine.
//!
//! ```text
//!            ntp/server age<=high
//!        ┌──────────────────────────┐
//!        ▼                          │
//!      HIGH ◄──────► MEDIUM ◄──────► LOW
//!        ▲                          ▲
//!        └──────────────────────────┘
//!         rtc / unknown / age>medium
//! ```
//!
//! [`TimeHealthMonitor::step`] is a pure transition function: it takes the
//! previous state and one input and returns the next state plus the
//! signals the transition produced. The engine decides when a step is
//! committed, so a record that fails to store leaves health untouched.

use declog_interchange::{TimestampSource, TrustTier};
use serde::Serialize;

use crate::config::TimeHealthConfig;

/// One time-health reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub source: TimestampSource,
    /// Seconds since the actor's last clock sync, as reported.
    pub sync_age_s: f64,
    /// Engine clock reading when the observation was made.
    pub observed_at: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthInput {
    /// Observation carried by an accepted record.
    Record(Observation),
    /// Observation reported out of band (no record).
    Heartbeat(Observation),
    /// Age the last observation to `now`.
    Tick { now: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeHealthState {
    pub tier: TrustTier,
    pub rationale: String,
    pub source: TimestampSource,
    /// Sync age at `observed_at`.
    pub sync_age_s: f64,
    pub observed_at: f64,
    /// The LOW-sojourn warning has been raised.
    pub warned: bool,
}

impl TimeHealthState {
    /// Sync age extrapolated to `now`.
    pub fn age_at(&self, now: f64) -> f64 {
        self.sync_age_s + (now - self.observed_at).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthSignal {
    /// The tier changed (or was established).
    Gate { tier: TrustTier, rationale: String },
    /// First record observed during a LOW sojourn.
    Warning { rationale: String },
}

#[derive(Debug, Clone, Default)]
pub struct TimeHealthMonitor {
    config: TimeHealthConfig,
}

impl TimeHealthMonitor {
    pub fn new(config: TimeHealthConfig) -> Self {
        TimeHealthMonitor { config }
    }

    pub fn config(&self) -> &TimeHealthConfig {
        &self.config
    }

    /// Tier and rationale for a source at a given sync age.
    pub fn classify(&self, source: TimestampSource, age: f64) -> (TrustTier, String) {
        let high = self.config.high_threshold_s;
        let medium = self.config.medium_threshold_s;
        match source {
            TimestampSource::Ntp | TimestampSource::Server => {
                if age <= high as f64 {
                    (TrustTier::High, format!("source={}; age<={}s", source, high))
                } else if age <= medium as f64 {
                    (
                        TrustTier::Medium,
                        format!("source={}; {}s<age<={}s", source, high, medium),
                    )
                } else {
                    (TrustTier::Low, format!("source={}; age>{}s", source, medium))
                }
            }
            TimestampSource::Gateway => {
                if age <= medium as f64 {
                    (TrustTier::Medium, format!("source=gateway; age<={}s", medium))
                } else {
                    (TrustTier::Low, format!("source=gateway; age>{}s", medium))
                }
            }
            TimestampSource::Rtc | TimestampSource::Unknown => {
                (TrustTier::Low, format!("source={}", source))
            }
        }
    }

    /// Apply one input. Returns `None` when the input has nothing to act on
    /// (a tick for an actor never observed).
    pub fn step(
        &self,
        prev: Option<&TimeHealthState>,
        input: HealthInput,
    ) -> Option<(TimeHealthState, Vec<HealthSignal>)> {
        match input {
            HealthInput::Record(obs) => Some(self.on_record(prev, obs)),
            HealthInput::Heartbeat(obs) => Some(self.transition(prev, self.observed(obs), false)),
            HealthInput::Tick { now } => {
                let prev = prev?;
                let (tier, rationale) = self.classify(prev.source, prev.age_at(now));
                let next = TimeHealthState {
                    tier,
                    rationale,
                    ..prev.clone()
                };
                Some(self.transition(Some(prev), next, false))
            }
        }
    }

    /// [`HealthInput::Record`] without the `Option`.
    pub fn on_record(
        &self,
        prev: Option<&TimeHealthState>,
        obs: Observation,
    ) -> (TimeHealthState, Vec<HealthSignal>) {
        self.transition(prev, self.observed(obs), true)
    }

    fn observed(&self, obs: Observation) -> TimeHealthState {
        let (tier, rationale) = self.classify(obs.source, obs.sync_age_s);
        TimeHealthState {
            tier,
            rationale,
            source: obs.source,
            sync_age_s: obs.sync_age_s,
            observed_at: obs.observed_at,
            warned: false,
        }
    }

    fn transition(
        &self,
        prev: Option<&TimeHealthState>,
        mut next: TimeHealthState,
        from_record: bool,
    ) -> (TimeHealthState, Vec<HealthSignal>) {
        let was_warned = prev.is_some_and(|p| p.tier == TrustTier::Low && p.warned);
        let mut signals = Vec::new();
        if prev.map_or(true, |p| p.tier != next.tier) {
            signals.push(HealthSignal::Gate {
                tier: next.tier,
                rationale: next.rationale.clone(),
            });
        }
        next.warned = next.tier == TrustTier::Low && was_warned;
        if next.tier == TrustTier::Low && from_record && !was_warned {
            next.warned = true;
            signals.push(HealthSignal::Warning {
                rationale: next.rationale.clone(),
            });
        }
        (next, signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(source: TimestampSource, age: f64, at: f64) -> Observation {
        Observation {
            source,
            sync_age_s: age,
            observed_at: at,
        }
    }

    fn monitor() -> TimeHealthMonitor {
        TimeHealthMonitor::default()
    }

    fn gates(signals: &[HealthSignal]) -> usize {
        signals
            .iter()
            .filter(|s| matches!(s, HealthSignal::Gate { .. }))
            .count()
    }

    fn warnings(signals: &[HealthSignal]) -> usize {
        signals
            .iter()
            .filter(|s| matches!(s, HealthSignal::Warning { .. }))
            .count()
    }

    #[test]
    fn classify_covers_every_source() {
        let m = monitor();
        let cases = [
            (TimestampSource::Ntp, 10.0, TrustTier::High, "source=ntp; age<=600s"),
            (TimestampSource::Ntp, 600.0, TrustTier::High, "source=ntp; age<=600s"),
            (TimestampSource::Ntp, 601.0, TrustTier::Medium, "source=ntp; 600s<age<=3600s"),
            (TimestampSource::Ntp, 3601.0, TrustTier::Low, "source=ntp; age>3600s"),
            (TimestampSource::Server, 5.0, TrustTier::High, "source=server; age<=600s"),
            (TimestampSource::Gateway, 5.0, TrustTier::Medium, "source=gateway; age<=3600s"),
            (TimestampSource::Gateway, 4000.0, TrustTier::Low, "source=gateway; age>3600s"),
            (TimestampSource::Rtc, 0.0, TrustTier::Low, "source=rtc"),
            (TimestampSource::Unknown, 0.0, TrustTier::Low, "source=unknown"),
        ];
        for (source, age, tier, rationale) in cases {
            assert_eq!(m.classify(source, age), (tier, rationale.to_string()), "{source} {age}");
        }
    }

    #[test]
    fn custom_thresholds_show_in_rationale() {
        let m = TimeHealthMonitor::new(TimeHealthConfig {
            high_threshold_s: 30,
            medium_threshold_s: 120,
        });
        assert_eq!(
            m.classify(TimestampSource::Ntp, 60.0),
            (TrustTier::Medium, "source=ntp; 30s<age<=120s".to_string())
        );
    }

    #[test]
    fn first_observation_emits_gate() {
        let (state, signals) = monitor()
            .step(None, HealthInput::Record(obs(TimestampSource::Ntp, 10.0, 0.0)))
            .unwrap();
        assert_eq!(state.tier, TrustTier::High);
        assert_eq!(
            signals,
            vec![HealthSignal::Gate {
                tier: TrustTier::High,
                rationale: "source=ntp; age<=600s".into()
            }]
        );
    }

    #[test]
    fn same_tier_is_silent() {
        let m = monitor();
        let (s1, _) = m
            .step(None, HealthInput::Record(obs(TimestampSource::Ntp, 10.0, 0.0)))
            .unwrap();
        let (_, signals) = m
            .step(Some(&s1), HealthInput::Record(obs(TimestampSource::Ntp, 20.0, 1.0)))
            .unwrap();
        assert!(signals.is_empty());
    }

    #[test]
    fn warning_once_per_low_sojourn() {
        let m = monitor();
        let rtc = |at| HealthInput::Record(obs(TimestampSource::Rtc, 0.0, at));
        let (s1, _) = m
            .step(None, HealthInput::Record(obs(TimestampSource::Ntp, 10.0, 0.0)))
            .unwrap();
        let (s2, sig2) = m.step(Some(&s1), rtc(1.0)).unwrap();
        assert_eq!((gates(&sig2), warnings(&sig2)), (1, 1));
        let (s3, sig3) = m.step(Some(&s2), rtc(2.0)).unwrap();
        assert!(sig3.is_empty());

        // Recovery clears the warning; the next LOW sojourn warns again.
        let (s4, _) = m
            .step(Some(&s3), HealthInput::Record(obs(TimestampSource::Ntp, 1.0, 3.0)))
            .unwrap();
        assert!(!s4.warned);
        let (_, sig5) = m.step(Some(&s4), rtc(4.0)).unwrap();
        assert_eq!(warnings(&sig5), 1);
    }

    #[test]
    fn tick_degrades_without_warning() {
        let m = monitor();
        let (s1, _) = m
            .step(None, HealthInput::Record(obs(TimestampSource::Ntp, 10.0, 1000.0)))
            .unwrap();
        let (s2, sig) = m.step(Some(&s1), HealthInput::Tick { now: 1700.0 }).unwrap();
        assert_eq!(s2.tier, TrustTier::Medium);
        assert_eq!(gates(&sig), 1);

        let (s3, sig) = m.step(Some(&s2), HealthInput::Tick { now: 5000.0 }).unwrap();
        assert_eq!(s3.tier, TrustTier::Low);
        assert_eq!((gates(&sig), warnings(&sig)), (1, 0));
        assert_eq!(s3.observed_at, 1000.0);

        // The next record while still LOW raises the warning.
        let (_, sig) = m
            .step(Some(&s3), HealthInput::Record(obs(TimestampSource::Rtc, 0.0, 5001.0)))
            .unwrap();
        assert_eq!((gates(&sig), warnings(&sig)), (0, 1));
    }

    #[test]
    fn tick_without_history_is_noop() {
        assert!(monitor().step(None, HealthInput::Tick { now: 1.0 }).is_none());
    }

    #[test]
    fn heartbeat_transitions_without_warning() {
        let m = monitor();
        let (s1, _) = m
            .step(None, HealthInput::Record(obs(TimestampSource::Ntp, 10.0, 0.0)))
            .unwrap();
        let (s2, sig) = m
            .step(
                Some(&s1),
                HealthInput::Heartbeat(obs(TimestampSource::parse_lenient(None), 0.0, 1.0)),
            )
            .unwrap();
        assert_eq!(s2.tier, TrustTier::Low);
        assert_eq!((gates(&sig), warnings(&sig)), (1, 0));
    }

    #[test]
    fn warned_flag_survives_ticks_in_low() {
        let m = monitor();
        let (s1, _) = m
            .step(None, HealthInput::Record(obs(TimestampSource::Rtc, 0.0, 0.0)))
            .unwrap();
        assert!(s1.warned);
        let (s2, sig) = m.step(Some(&s1), HealthInput::Tick { now: 10.0 }).unwrap();
        assert!(s2.warned && sig.is_empty());
        let (_, sig) = m
            .step(Some(&s2), HealthInput::Record(obs(TimestampSource::Rtc, 0.0, 11.0)))
            .unwrap();
        assert!(sig.is_empty());
    }
}
