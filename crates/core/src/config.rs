//! Engine configuration.
//!
//! Every field has a default, so an empty TOML table (or no file at all)
//! yields a working engine:
//!
//! ```toml
//! [ordering]
//! out_of_order = "reject"          # or "accept_and_flag"
//!
//! [time_health]
//! high_threshold_s = 600
//! medium_threshold_s = 3600
//!
//! [signatures]
//! mandatory_classes = ["payment"]
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ordering: OrderingConfig,
    pub time_health: TimeHealthConfig,
    pub signatures: SignatureConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let th = &self.time_health;
        if th.high_threshold_s > th.medium_threshold_s {
            return Err(ConfigError::ThresholdOrder {
                high: th.high_threshold_s,
                medium: th.medium_threshold_s,
            });
        }
        Ok(())
    }
}

/// What to do with a record whose seq is at or below the stream cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfOrderPolicy {
    /// Report `OutOfOrder` and do not append.
    #[default]
    Reject,
    /// Accept with an out-of-order flag, but only for ingests the caller
    /// marks as backfill. Live ingests are still rejected.
    AcceptAndFlag,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderingConfig {
    pub out_of_order: OutOfOrderPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeHealthConfig {
    /// Max sync age (seconds) for HIGH.
    pub high_threshold_s: u64,
    /// Max sync age (seconds) for MEDIUM.
    pub medium_threshold_s: u64,
}

impl Default for TimeHealthConfig {
    fn default() -> Self {
        TimeHealthConfig {
            high_threshold_s: 600,
            medium_threshold_s: 3600,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    /// Actor classes (`device` in `device:a`) whose records must be signed.
    pub mandatory_classes: BTreeSet<String>,
}

impl SignatureConfig {
    pub fn is_mandatory(&self, class: &str) -> bool {
        self.mandatory_classes.contains(class)
    }
}
