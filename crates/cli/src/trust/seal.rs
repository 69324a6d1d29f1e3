//! Producer-side helpers: compute entry hashes and sign records.

use declog_core::integrity;
use declog_interchange::ValidationError;
use ed25519_dalek::SigningKey;
use serde_json::Value;

/// Validate one candidate line and return it sealed (and signed when a key
/// is given) as a compact JSON line.
pub fn seal_line(line: &str, key: Option<&SigningKey>) -> Result<String, ValidationError> {
    let mut record = declog_interchange::validate_line(line)?;
    match key {
        Some(key) => {
            integrity::sign(&mut record, key);
        }
        None => {
            integrity::seal(&mut record);
        }
    }
    Ok(record.to_value().to_string())
}

/// Entry hash of one JSON record.
pub fn hash_value(raw: &Value) -> Result<String, ValidationError> {
    let record = declog_interchange::validate(raw)?;
    Ok(integrity::compute_entry_hash(&record))
}
