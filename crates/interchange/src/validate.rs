//! Record validation: candidate JSON in, typed [`DecisionRecord`] out.
//!
//! The main entry point is [`validate`]. Checks run in a fixed order and
//! the first failure is returned; a record is never partially accepted.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};

use crate::types::*;

/// Longest rationale accepted, in characters.
pub const MAX_RATIONALE_CHARS: usize = 256;

/// Fields every record must carry, in the order their presence is checked.
const REQUIRED: &[&str] = &[
    "actor",
    "intent_id",
    "action",
    "rationale",
    "seq",
    "run_id",
    "timestamp.value",
    "timestamp.source",
];

/// Why a candidate record was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The input is not a JSON object.
    Malformed(String),
    /// A required field is absent or null.
    MissingField { field: String },
    /// A field has the wrong JSON type.
    InvalidType {
        field: String,
        expected: &'static str,
    },
    /// A field has the right type but an unacceptable value.
    InvalidValue { field: String, reason: String },
}

impl ValidationError {
    /// Dotted path of the failing field, if the failure is field-specific.
    pub fn field(&self) -> Option<&str> {
        match self {
            ValidationError::Malformed(_) => None,
            ValidationError::MissingField { field }
            | ValidationError::InvalidType { field, .. }
            | ValidationError::InvalidValue { field, .. } => Some(field),
        }
    }

    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ValidationError::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    fn wrong_type(field: &str, expected: &'static str) -> Self {
        ValidationError::InvalidType {
            field: field.to_string(),
            expected,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Malformed(msg) => write!(f, "malformed record: {}", msg),
            ValidationError::MissingField { field } => {
                write!(f, "missing required field '{}'", field)
            }
            ValidationError::InvalidType { field, expected } => {
                write!(f, "field '{}' must be {}", field, expected)
            }
            ValidationError::InvalidValue { field, reason } => {
                write!(f, "field '{}' is invalid: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Parse one NDJSON line and validate it.
pub fn validate_line(line: &str) -> Result<DecisionRecord, ValidationError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    validate(&value)
}

/// Validate a candidate record.
///
/// Order: object shape, presence of required fields, action grammar,
/// rationale, seq, timestamp, temporal block, model block, then the
/// optional scalar fields and the integrity block.
pub fn validate(raw: &Value) -> Result<DecisionRecord, ValidationError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ValidationError::Malformed("record is not a JSON object".to_string()))?;

    for path in REQUIRED {
        if lookup(obj, path).map_or(true, Value::is_null) {
            return Err(ValidationError::MissingField {
                field: path.to_string(),
            });
        }
    }

    let actor = non_empty_str(obj, "actor")?;
    let intent_id = non_empty_str(obj, "intent_id")?;

    let action = required_str(obj, "action")?;
    if !is_dotted_action(&action) {
        return Err(ValidationError::invalid(
            "action",
            format!("'{}' is not lowercase dot-notation (e.g. 'hvac.setpoint.adjust')", action),
        ));
    }

    let rationale = required_str(obj, "rationale")?;
    if rationale.is_empty() {
        return Err(ValidationError::invalid("rationale", "must not be empty"));
    }
    let chars = rationale.chars().count();
    if chars > MAX_RATIONALE_CHARS {
        return Err(ValidationError::invalid(
            "rationale",
            format!("{} characters exceeds limit of {}", chars, MAX_RATIONALE_CHARS),
        ));
    }

    let seq = obj
        .get("seq")
        .and_then(Value::as_u64)
        .ok_or_else(|| ValidationError::wrong_type("seq", "a non-negative integer"))?;

    let run_id = non_empty_str(obj, "run_id")?;
    let timestamp = parse_timestamp(obj)?;
    let temporal = parse_temporal(obj)?;
    let model = parse_model(obj)?;

    let schema_version = match obj.get("v") {
        None => None,
        Some(v) => match v.as_u64() {
            Some(n) if n > 0 => Some(n),
            _ => return Err(ValidationError::wrong_type("v", "a positive integer")),
        },
    };

    let id = match optional_str(obj, "id")? {
        Some(id) if id.is_empty() => {
            return Err(ValidationError::invalid("id", "must not be empty when present"))
        }
        other => other,
    };
    let correlation_id = optional_str(obj, "correlation_id")?;
    let artifact_hash = optional_str(obj, "artifact_hash")?;
    let result = parse_result(obj)?;
    let integrity = parse_integrity(obj)?;

    let extensions = extra_keys(obj, KNOWN_FIELDS);

    Ok(DecisionRecord {
        schema_version,
        id,
        actor,
        intent_id,
        action,
        rationale,
        seq,
        run_id,
        correlation_id,
        timestamp,
        temporal,
        result,
        model,
        artifact_hash,
        integrity,
        extensions,
    })
}

/// `^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)+$`
fn is_dotted_action(action: &str) -> bool {
    let mut segments = 0usize;
    for segment in action.split('.') {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_lowercase() => {}
            _ => return false,
        }
        if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
            return false;
        }
        segments += 1;
    }
    segments >= 2
}

// ── Block parsers ───────────────────────────────────────────────────

fn parse_timestamp(obj: &Map<String, Value>) -> Result<Timestamp, ValidationError> {
    let block = obj
        .get("timestamp")
        .and_then(Value::as_object)
        .ok_or_else(|| ValidationError::wrong_type("timestamp", "an object"))?;

    let value = match block.get("value") {
        Some(Value::String(s)) => {
            let v = TimestampValue::Text(s.clone());
            if v.unix_nanos().is_none() {
                return Err(ValidationError::invalid(
                    "timestamp.value",
                    format!("'{}' is not an ISO-8601 timestamp", s),
                ));
            }
            v
        }
        Some(Value::Number(n)) => {
            let v = TimestampValue::Epoch(n.clone());
            if v.unix_nanos().is_none() {
                return Err(ValidationError::invalid(
                    "timestamp.value",
                    "epoch seconds must be non-negative",
                ));
            }
            v
        }
        _ => {
            return Err(ValidationError::wrong_type(
                "timestamp.value",
                "an ISO-8601 string or epoch number",
            ))
        }
    };

    let source_str = block
        .get("source")
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::wrong_type("timestamp.source", "a string"))?;
    let source = TimestampSource::parse(source_str).ok_or_else(|| {
        ValidationError::invalid(
            "timestamp.source",
            format!(
                "'{}' is not one of ntp, gateway, rtc, server, unknown",
                source_str
            ),
        )
    })?;

    let sync_age_s = match block.get("sync_age_s") {
        None => None,
        Some(Value::Number(n)) if n.as_f64().is_some_and(|f| f >= 0.0) => Some(n.clone()),
        Some(_) => {
            return Err(ValidationError::wrong_type(
                "timestamp.sync_age_s",
                "a non-negative number",
            ))
        }
    };

    Ok(Timestamp {
        value,
        source,
        sync_age_s,
        extra: extra_keys(block, &["value", "source", "sync_age_s"]),
    })
}

fn parse_temporal(obj: &Map<String, Value>) -> Result<Option<Temporal>, ValidationError> {
    let Some(raw) = obj.get("temporal") else {
        return Ok(None);
    };
    let block = raw
        .as_object()
        .ok_or_else(|| ValidationError::wrong_type("temporal", "an object"))?;

    let mode_str = block
        .get("mode")
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::MissingField {
            field: "temporal.mode".to_string(),
        })?;
    let mode = TemporalMode::parse(mode_str).ok_or_else(|| {
        ValidationError::invalid(
            "temporal.mode",
            format!("'{}' is not one of monotonic, lamport, hybrid", mode_str),
        )
    })?;

    let lamport = match block.get("lamport") {
        None => None,
        Some(v) => Some(v.as_u64().ok_or_else(|| {
            ValidationError::wrong_type("temporal.lamport", "a non-negative integer")
        })?),
    };
    if mode.requires_counter() && lamport.is_none() {
        return Err(ValidationError::MissingField {
            field: "temporal.lamport".to_string(),
        });
    }

    Ok(Some(Temporal {
        mode,
        lamport,
        extra: extra_keys(block, &["mode", "lamport"]),
    }))
}

fn parse_model(obj: &Map<String, Value>) -> Result<Option<ModelRef>, ValidationError> {
    let Some(raw) = obj.get("model") else {
        return Ok(None);
    };
    let block = raw
        .as_object()
        .ok_or_else(|| ValidationError::wrong_type("model", "an object"))?;
    let id = nested_non_empty_str(block, "model", "id")?;
    let version = nested_non_empty_str(block, "model", "version")?;
    Ok(Some(ModelRef {
        id,
        version,
        extra: extra_keys(block, &["id", "version"]),
    }))
}

fn parse_result(obj: &Map<String, Value>) -> Result<Option<ResultBlock>, ValidationError> {
    let Some(raw) = obj.get("result") else {
        return Ok(None);
    };
    let block = raw
        .as_object()
        .ok_or_else(|| ValidationError::wrong_type("result", "an object"))?;
    let status_str = block
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::MissingField {
            field: "result.status".to_string(),
        })?;
    let status = ResultStatus::parse(status_str).ok_or_else(|| {
        ValidationError::invalid(
            "result.status",
            format!(
                "'{}' is not one of executed, aborted, simulated, skipped",
                status_str
            ),
        )
    })?;
    Ok(Some(ResultBlock {
        status,
        extra: extra_keys(block, &["status"]),
    }))
}

fn parse_integrity(obj: &Map<String, Value>) -> Result<Option<Integrity>, ValidationError> {
    let Some(raw) = obj.get("integrity") else {
        return Ok(None);
    };
    let block = raw
        .as_object()
        .ok_or_else(|| ValidationError::wrong_type("integrity", "an object"))?;
    let entry_hash = nested_optional_str(block, "integrity", "entry_hash")?;
    let signature = nested_optional_str(block, "integrity", "signature")?;
    Ok(Some(Integrity {
        entry_hash,
        signature,
        extra: extra_keys(block, &["entry_hash", "signature"]),
    }))
}

// ── Field helpers ───────────────────────────────────────────────────

/// Keys of `block` not in `known`, kept verbatim.
fn extra_keys(block: &Map<String, Value>, known: &[&str]) -> BTreeMap<String, Value> {
    block
        .iter()
        .filter(|(k, _)| !known.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn lookup<'a>(obj: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut cur = obj.get(first)?;
    for part in parts {
        cur = cur.as_object()?.get(part)?;
    }
    Some(cur)
}

fn required_str(obj: &Map<String, Value>, field: &str) -> Result<String, ValidationError> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ValidationError::wrong_type(field, "a string"))
}

fn non_empty_str(obj: &Map<String, Value>, field: &str) -> Result<String, ValidationError> {
    let s = required_str(obj, field)?;
    if s.is_empty() {
        return Err(ValidationError::invalid(field, "must not be empty"));
    }
    Ok(s)
}

fn optional_str(obj: &Map<String, Value>, field: &str) -> Result<Option<String>, ValidationError> {
    match obj.get(field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ValidationError::wrong_type(field, "a string")),
    }
}

fn nested_non_empty_str(
    block: &Map<String, Value>,
    parent: &str,
    field: &str,
) -> Result<String, ValidationError> {
    let path = format!("{}.{}", parent, field);
    match block.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField { field: path }),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(ValidationError::invalid(&path, "must not be empty")),
        Some(_) => Err(ValidationError::wrong_type(&path, "a string")),
    }
}

fn nested_optional_str(
    block: &Map<String, Value>,
    parent: &str,
    field: &str,
) -> Result<Option<String>, ValidationError> {
    match block.get(field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ValidationError::wrong_type(
            &format!("{}.{}", parent, field),
            "a string",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Value {
        json!({
            "v": 1,
            "id": "rec-1",
            "actor": "device:a",
            "intent_id": "intent-1",
            "action": "hvac.setpoint.adjust",
            "rationale": "room above comfort band",
            "seq": 1,
            "run_id": "r1",
            "timestamp": {"value": "2025-03-01T12:00:00Z", "source": "ntp", "sync_age_s": 10},
            "temporal": {"mode": "monotonic"},
            "result": {"status": "executed"},
            "integrity": {"entry_hash": "00"}
        })
    }

    fn with(mut v: Value, path: &[&str], new: Value) -> Value {
        let mut cur = &mut v;
        for p in &path[..path.len() - 1] {
            cur = cur.get_mut(*p).unwrap();
        }
        cur[path[path.len() - 1]] = new;
        v
    }

    fn without(mut v: Value, path: &[&str]) -> Value {
        let mut cur = &mut v;
        for p in &path[..path.len() - 1] {
            cur = cur.get_mut(*p).unwrap();
        }
        cur.as_object_mut().unwrap().remove(path[path.len() - 1]);
        v
    }

    #[test]
    fn valid_record_parses() {
        let rec = validate(&base()).expect("valid");
        assert_eq!(rec.actor, "device:a");
        assert_eq!(rec.seq, 1);
        assert_eq!(rec.timestamp.source, TimestampSource::Ntp);
        assert_eq!(rec.mode(), TemporalMode::Monotonic);
        assert_eq!(rec.outcome(), Outcome::Reported(ResultStatus::Executed));
        assert_eq!(rec.entry_hash(), Some("00"));
    }

    #[test]
    fn non_object_is_malformed() {
        let err = validate(&json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
        assert_eq!(err.field(), None);
    }

    #[test]
    fn unparseable_line_is_malformed() {
        let err = validate_line("{not json").unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
    }

    #[test]
    fn each_required_field_is_reported_by_name() {
        for path in REQUIRED {
            let parts: Vec<&str> = path.split('.').collect();
            let err = validate(&without(base(), &parts)).unwrap_err();
            assert_eq!(
                err,
                ValidationError::MissingField {
                    field: path.to_string()
                },
                "removing {}",
                path
            );
        }
    }

    #[test]
    fn null_required_field_counts_as_missing() {
        let err = validate(&with(base(), &["run_id"], Value::Null)).unwrap_err();
        assert_eq!(err.field(), Some("run_id"));
    }

    #[test]
    fn first_failing_field_wins() {
        // Both action and rationale are bad; action is checked first.
        let v = with(base(), &["action"], json!("Bad Action"));
        let v = with(v, &["rationale"], json!(""));
        assert_eq!(validate(&v).unwrap_err().field(), Some("action"));
    }

    #[test]
    fn action_grammar() {
        for good in ["hvac.adjust", "a.b.c", "model.version_2.promote", "x1.y_"] {
            assert!(is_dotted_action(good), "{}", good);
        }
        for bad in [
            "hvac",
            "Hvac.adjust",
            "hvac..adjust",
            ".hvac",
            "hvac.",
            "1a.b",
            "a.B",
            "a-b.c",
        ] {
            assert!(!is_dotted_action(bad), "{}", bad);
        }
    }

    #[test]
    fn rationale_limit_counts_characters_not_bytes() {
        let at_limit: String = "é".repeat(MAX_RATIONALE_CHARS);
        assert!(validate(&with(base(), &["rationale"], json!(at_limit))).is_ok());

        let over: String = "a".repeat(MAX_RATIONALE_CHARS + 1);
        let err = validate(&with(base(), &["rationale"], json!(over))).unwrap_err();
        assert_eq!(err.field(), Some("rationale"));
    }

    #[test]
    fn empty_rationale_rejected() {
        let err = validate(&with(base(), &["rationale"], json!(""))).unwrap_err();
        assert_eq!(err.field(), Some("rationale"));
    }

    #[test]
    fn negative_or_fractional_seq_rejected() {
        for bad in [json!(-1), json!(1.5), json!("1")] {
            let err = validate(&with(base(), &["seq"], bad)).unwrap_err();
            assert_eq!(err.field(), Some("seq"));
        }
    }

    #[test]
    fn timestamp_source_must_be_known() {
        let err = validate(&with(base(), &["timestamp", "source"], json!("gps"))).unwrap_err();
        assert_eq!(err.field(), Some("timestamp.source"));
    }

    #[test]
    fn epoch_timestamp_accepted() {
        let rec = validate(&with(base(), &["timestamp", "value"], json!(1_740_830_400u64)))
            .expect("epoch accepted");
        assert!(matches!(rec.timestamp.value, TimestampValue::Epoch(_)));
    }

    #[test]
    fn garbage_timestamp_text_rejected() {
        let err = validate(&with(base(), &["timestamp", "value"], json!("noon"))).unwrap_err();
        assert_eq!(err.field(), Some("timestamp.value"));
    }

    #[test]
    fn lamport_and_hybrid_require_counter() {
        for mode in ["lamport", "hybrid"] {
            let v = with(base(), &["temporal"], json!({"mode": mode}));
            let err = validate(&v).unwrap_err();
            assert_eq!(err.field(), Some("temporal.lamport"), "{}", mode);

            let v = with(base(), &["temporal"], json!({"mode": mode, "lamport": 4}));
            assert_eq!(validate(&v).unwrap().lamport(), Some(4));
        }
    }

    #[test]
    fn negative_lamport_rejected() {
        let v = with(base(), &["temporal"], json!({"mode": "lamport", "lamport": -3}));
        assert_eq!(validate(&v).unwrap_err().field(), Some("temporal.lamport"));
    }

    #[test]
    fn unknown_temporal_mode_rejected() {
        let v = with(base(), &["temporal"], json!({"mode": "vector"}));
        assert_eq!(validate(&v).unwrap_err().field(), Some("temporal.mode"));
    }

    #[test]
    fn missing_temporal_defaults_to_monotonic() {
        let rec = validate(&without(base(), &["temporal"])).unwrap();
        assert_eq!(rec.temporal, None);
        assert_eq!(rec.mode(), TemporalMode::Monotonic);
    }

    #[test]
    fn model_block_needs_id_and_version() {
        let v = with(base(), &["model"], json!({"id": "thermo-llm"}));
        assert_eq!(validate(&v).unwrap_err().field(), Some("model.version"));

        let v = with(base(), &["model"], json!({"version": "1.0"}));
        assert_eq!(validate(&v).unwrap_err().field(), Some("model.id"));

        let v = with(
            base(),
            &["model"],
            json!({"id": "thermo-llm", "version": "2.1.0", "provider": "local"}),
        );
        let rec = validate(&v).unwrap();
        let model = rec.model.unwrap();
        assert_eq!(model.version, "2.1.0");
        assert_eq!(model.extra.get("provider"), Some(&json!("local")));
    }

    #[test]
    fn absent_result_is_unknown_outcome() {
        let rec = validate(&without(base(), &["result"])).unwrap();
        assert_eq!(rec.outcome(), Outcome::Unknown);
    }

    #[test]
    fn result_status_must_be_known() {
        let v = with(base(), &["result"], json!({"status": "done"}));
        assert_eq!(validate(&v).unwrap_err().field(), Some("result.status"));
    }

    #[test]
    fn unknown_keys_inside_blocks_are_kept() {
        let v = with(base(), &["timestamp", "drift_ppm"], json!(12));
        let v = with(v, &["temporal", "epoch"], json!(3));
        let rec = validate(&v).unwrap();
        assert_eq!(rec.timestamp.extra.get("drift_ppm"), Some(&json!(12)));
        assert_eq!(rec.to_value(), v);
    }

    #[test]
    fn null_optional_field_is_a_type_error() {
        let v = with(base(), &["correlation_id"], Value::Null);
        assert_eq!(validate(&v).unwrap_err().field(), Some("correlation_id"));
    }

    #[test]
    fn unknown_top_level_blocks_pass_through() {
        let v = with(base(), &["telemetry"], json!({"rssi": -70, "hops": [1, 2]}));
        let rec = validate(&v).unwrap();
        assert_eq!(
            rec.extensions.get("telemetry"),
            Some(&json!({"rssi": -70, "hops": [1, 2]}))
        );
        assert_eq!(rec.to_value()["telemetry"], json!({"rssi": -70, "hops": [1, 2]}));
    }

    #[test]
    fn serialisation_mirrors_input() {
        let input = base();
        let rec = validate(&input).unwrap();
        assert_eq!(rec.to_value(), input);
    }

    #[test]
    fn stored_form_deserialises_back() {
        let rec = validate(&base()).unwrap();
        let back: DecisionRecord = serde_json::from_value(rec.to_value()).unwrap();
        assert_eq!(back, rec);
    }
}
