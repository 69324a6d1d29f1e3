//! `declog.toml`: engine settings plus the CLI-only `[keys]` and
//! `[logging]` tables.
//!
//! ```toml
//! [ordering]
//! out_of_order = "accept_and_flag"
//!
//! [time_health]
//! high_threshold_s = 600
//! medium_threshold_s = 3600
//!
//! [signatures]
//! mandatory_classes = ["payment"]
//!
//! [keys]
//! "payment:gw-1" = "base64 Ed25519 public key"
//!
//! [logging]
//! filter = "declog_core=debug,info"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use declog_core::config::{OrderingConfig, SignatureConfig, TimeHealthConfig};
use declog_core::{EngineConfig, Keyring};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub ordering: OrderingConfig,
    pub time_health: TimeHealthConfig,
    pub signatures: SignatureConfig,
    /// Actor identity -> base64 Ed25519 public key.
    pub keys: BTreeMap<String, String>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive; `RUST_LOG` takes precedence.
    pub filter: Option<String>,
}

impl CliConfig {
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            ordering: self.ordering.clone(),
            time_health: self.time_health.clone(),
            signatures: self.signatures.clone(),
        }
    }

    pub fn keyring(&self) -> Result<Keyring, String> {
        Keyring::from_base64(&self.keys).map_err(|e| e.to_string())
    }
}

/// Read and parse a config file. Returns a human-readable error string on
/// failure, including threshold sanity errors.
pub fn read_config(path: &Path) -> Result<CliConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("could not read '{}': {}", path.display(), e))?;
    let config: CliConfig = toml::from_str(&content)
        .map_err(|e| format!("could not parse '{}': {}", path.display(), e))?;
    config
        .engine()
        .validate()
        .map_err(|e| format!("invalid config '{}': {}", path.display(), e))?;
    Ok(config)
}

/// `read_config` when a path is given, defaults otherwise.
pub fn load(path: Option<&Path>) -> Result<CliConfig, String> {
    match path {
        Some(p) => read_config(p),
        None => Ok(CliConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use declog_core::OutOfOrderPolicy;
    use tempfile::TempDir;

    fn write(tmp: &TempDir, body: &str) -> std::path::PathBuf {
        let path = tmp.path().join("declog.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn empty_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = read_config(&write(&tmp, "")).unwrap();
        assert_eq!(config.engine(), EngineConfig::default());
        assert!(config.keys.is_empty());
        assert_eq!(config.logging.filter, None);
    }

    #[test]
    fn full_file_parses() {
        let tmp = TempDir::new().unwrap();
        let body = r#"
[ordering]
out_of_order = "accept_and_flag"

[time_health]
high_threshold_s = 60

[signatures]
mandatory_classes = ["payment"]

[logging]
filter = "debug"
"#;
        let config = read_config(&write(&tmp, body)).unwrap();
        let engine = config.engine();
        assert_eq!(engine.ordering.out_of_order, OutOfOrderPolicy::AcceptAndFlag);
        assert_eq!(engine.time_health.high_threshold_s, 60);
        assert_eq!(engine.time_health.medium_threshold_s, 3600);
        assert!(engine.signatures.is_mandatory("payment"));
        assert_eq!(config.logging.filter.as_deref(), Some("debug"));
    }

    #[test]
    fn inverted_thresholds_rejected_at_load() {
        let tmp = TempDir::new().unwrap();
        let path = write(
            &tmp,
            "[time_health]\nhigh_threshold_s = 4000\nmedium_threshold_s = 3600\n",
        );
        let err = read_config(&path).unwrap_err();
        assert!(err.contains("must not exceed"), "{}", err);
    }

    #[test]
    fn bad_key_reported_by_actor() {
        let tmp = TempDir::new().unwrap();
        let config = read_config(&write(&tmp, "[keys]\n\"device:a\" = \"xyz\"\n")).unwrap();
        let err = config.keyring().unwrap_err();
        assert!(err.contains("device:a"), "{}", err);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = read_config(Path::new("/nonexistent/declog.toml")).unwrap_err();
        assert!(err.contains("could not read"));
    }
}
