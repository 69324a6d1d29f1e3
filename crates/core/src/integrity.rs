//! Content hashing and signatures.
//!
//! The entry hash is lowercase hex SHA-256 over the canonical form of the
//! record: every top-level field except `integrity`, object keys sorted at
//! every depth, compact encoding. A signature is a base64 Ed25519
//! signature over the ASCII bytes of that hex hash.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use declog_interchange::{normalize_hash, DecisionRecord, Integrity};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::SignatureConfig;
use crate::error::{ConfigError, IntegrityError};

/// External key/identity store: zero or one verification key per actor.
pub trait KeyLookup: Send + Sync {
    fn verifying_key(&self, actor: &str) -> Option<VerifyingKey>;
}

/// Map-backed [`KeyLookup`].
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    keys: BTreeMap<String, VerifyingKey>,
}

impl Keyring {
    pub fn new() -> Self {
        Keyring::default()
    }

    pub fn insert(&mut self, actor: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(actor.into(), key);
    }

    /// Build from `actor -> base64 public key` pairs, as found in the
    /// `[keys]` table of a config file.
    pub fn from_base64<'a, I>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut ring = Keyring::new();
        for (actor, encoded) in entries {
            let key = decode_verifying_key(encoded).map_err(|reason| ConfigError::InvalidKey {
                actor: actor.clone(),
                reason,
            })?;
            ring.insert(actor.clone(), key);
        }
        Ok(ring)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeyLookup for Keyring {
    fn verifying_key(&self, actor: &str) -> Option<VerifyingKey> {
        self.keys.get(actor).copied()
    }
}

/// Decode a base64 32-byte Ed25519 public key.
pub fn decode_verifying_key(encoded: &str) -> Result<VerifyingKey, String> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| format!("not valid base64: {}", e))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| "expected 32 key bytes".to_string())?;
    VerifyingKey::from_bytes(&arr).map_err(|e| format!("invalid key material: {}", e))
}

/// Outcome of a check that did not reject the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Hash matches and the signature verified.
    Verified,
    /// Hash matches and there is no signature (allowed for this actor).
    Unsigned,
    /// Hash matches; the signature failed but is not mandatory for this actor.
    SignatureUnverified(IntegrityError),
}

impl Verification {
    pub fn is_signature_unverified(&self) -> bool {
        matches!(self, Verification::SignatureUnverified(_))
    }
}

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// The hashed content of a record (everything but `integrity`).
pub fn canonical_content(record: &DecisionRecord) -> String {
    let mut value = record.to_value();
    if let Value::Object(map) = &mut value {
        map.remove("integrity");
    }
    canonical_json(&value)
}

pub fn compute_entry_hash(record: &DecisionRecord) -> String {
    format!("{:x}", Sha256::digest(canonical_content(record).as_bytes()))
}

/// Fill in `integrity.entry_hash` for the record's current content. Any
/// existing signature is dropped since it no longer covers the content.
pub fn seal(record: &mut DecisionRecord) -> String {
    let hash = compute_entry_hash(record);
    let integrity = record.integrity.get_or_insert_with(Integrity::default);
    integrity.entry_hash = Some(hash.clone());
    integrity.signature = None;
    hash
}

/// Seal, then sign the entry hash with `key`.
pub fn sign(record: &mut DecisionRecord, key: &SigningKey) -> String {
    let hash = seal(record);
    let signature = BASE64.encode(key.sign(hash.as_bytes()).to_bytes());
    if let Some(integrity) = record.integrity.as_mut() {
        integrity.signature = Some(signature.clone());
    }
    signature
}

/// Check a record's entry hash and, when present or required, its signature.
pub fn verify(
    record: &DecisionRecord,
    keys: &dyn KeyLookup,
    policy: &SignatureConfig,
) -> Result<Verification, IntegrityError> {
    let claimed = record.entry_hash().ok_or(IntegrityError::MissingHash)?;
    let computed = compute_entry_hash(record);
    if normalize_hash(claimed) != computed {
        return Err(IntegrityError::HashMismatch {
            expected: claimed.to_string(),
            actual: computed,
        });
    }

    let class = record.actor_class();
    let mandatory = policy.is_mandatory(class);
    let Some(signature) = record.signature() else {
        if mandatory {
            return Err(IntegrityError::MissingSignature {
                class: class.to_string(),
            });
        }
        return Ok(Verification::Unsigned);
    };

    match check_signature(&record.actor, &computed, signature, keys) {
        Ok(()) => Ok(Verification::Verified),
        Err(e) if mandatory => Err(e),
        Err(e) => Ok(Verification::SignatureUnverified(e)),
    }
}

fn check_signature(
    actor: &str,
    hash: &str,
    signature: &str,
    keys: &dyn KeyLookup,
) -> Result<(), IntegrityError> {
    let bad = |reason: String| IntegrityError::BadSignature { reason };

    let key = keys
        .verifying_key(actor)
        .ok_or_else(|| bad(format!("no verification key registered for '{}'", actor)))?;
    let bytes = BASE64
        .decode(signature)
        .map_err(|e| bad(format!("signature is not valid base64: {}", e)))?;
    let arr: [u8; 64] = bytes
        .try_into()
        .map_err(|_| bad("signature must be 64 bytes".to_string()))?;
    key.verify(hash.as_bytes(), &Signature::from_bytes(&arr))
        .map_err(|_| bad("signature does not match entry hash".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> DecisionRecord {
        declog_interchange::validate(&json!({
            "id": "rec-1",
            "actor": "device:a",
            "intent_id": "i-1",
            "action": "valve.close",
            "rationale": "overpressure",
            "seq": 1,
            "run_id": "r1",
            "timestamp": {"value": "2025-03-01T12:00:00Z", "source": "ntp", "sync_age_s": 10},
            "integrity": {"entry_hash": "00"}
        }))
        .unwrap()
    }

    fn keypair() -> (SigningKey, VerifyingKey) {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let public = key.verifying_key();
        (key, public)
    }

    fn mandatory(class: &str) -> SignatureConfig {
        SignatureConfig {
            mandatory_classes: [class.to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let v = json!({"b": {"z": 1, "a": [ {"y": true, "x": null} ]}, "a": "s"});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":"s","b":{"a":[{"x":null,"y":true}],"z":1}}"#
        );
    }

    #[test]
    fn hash_ignores_integrity_block() {
        let mut a = record();
        let b = record();
        a.integrity.as_mut().unwrap().entry_hash = Some("ff".into());
        assert_eq!(compute_entry_hash(&a), compute_entry_hash(&b));
        assert_eq!(compute_entry_hash(&a).len(), 64);
    }

    #[test]
    fn hash_covers_extensions() {
        let a = record();
        let mut b = record();
        b.extensions.insert("x_future".into(), json!({"k": 1}));
        assert_ne!(compute_entry_hash(&a), compute_entry_hash(&b));
    }

    #[test]
    fn sealed_record_verifies_unsigned() {
        let mut r = record();
        seal(&mut r);
        assert_eq!(
            verify(&r, &Keyring::new(), &SignatureConfig::default()),
            Ok(Verification::Unsigned)
        );
    }

    #[test]
    fn prefixed_uppercase_hash_accepted() {
        let mut r = record();
        let hash = seal(&mut r);
        r.integrity.as_mut().unwrap().entry_hash = Some(format!("sha256:{}", hash.to_uppercase()));
        assert!(verify(&r, &Keyring::new(), &SignatureConfig::default()).is_ok());
    }

    #[test]
    fn tampered_content_is_hash_mismatch_even_when_signed() {
        let (key, public) = keypair();
        let mut keys = Keyring::new();
        keys.insert("device:a", public);
        let mut r = record();
        sign(&mut r, &key);
        r.rationale = "nothing to see".into();
        match verify(&r, &keys, &SignatureConfig::default()) {
            Err(IntegrityError::HashMismatch { .. }) => {}
            other => panic!("expected HashMismatch, got {:?}", other),
        }
    }

    #[test]
    fn missing_hash_rejected() {
        let mut r = record();
        r.integrity = None;
        assert_eq!(
            verify(&r, &Keyring::new(), &SignatureConfig::default()),
            Err(IntegrityError::MissingHash)
        );
    }

    #[test]
    fn valid_signature_verifies() {
        let (key, public) = keypair();
        let mut keys = Keyring::new();
        keys.insert("device:a", public);
        let mut r = record();
        sign(&mut r, &key);
        assert_eq!(verify(&r, &keys, &mandatory("device")), Ok(Verification::Verified));
    }

    #[test]
    fn wrong_key_is_unverified_when_optional() {
        let (key, _) = keypair();
        let (_, other) = keypair();
        let mut keys = Keyring::new();
        keys.insert("device:a", other);
        let mut r = record();
        sign(&mut r, &key);
        let v = verify(&r, &keys, &SignatureConfig::default()).unwrap();
        assert!(v.is_signature_unverified());
    }

    #[test]
    fn wrong_key_rejected_when_mandatory() {
        let (key, _) = keypair();
        let (_, other) = keypair();
        let mut keys = Keyring::new();
        keys.insert("device:a", other);
        let mut r = record();
        sign(&mut r, &key);
        assert!(matches!(
            verify(&r, &keys, &mandatory("device")),
            Err(IntegrityError::BadSignature { .. })
        ));
    }

    #[test]
    fn unregistered_actor_signature_is_bad() {
        let (key, _) = keypair();
        let mut r = record();
        sign(&mut r, &key);
        match verify(&r, &Keyring::new(), &SignatureConfig::default()) {
            Ok(Verification::SignatureUnverified(IntegrityError::BadSignature { reason })) => {
                assert!(reason.contains("no verification key"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_signature_for_mandatory_class() {
        let mut r = record();
        seal(&mut r);
        assert_eq!(
            verify(&r, &Keyring::new(), &mandatory("device")),
            Err(IntegrityError::MissingSignature {
                class: "device".into()
            })
        );
    }

    #[test]
    fn resealing_drops_stale_signature() {
        let (key, _) = keypair();
        let mut r = record();
        sign(&mut r, &key);
        r.seq = 2;
        seal(&mut r);
        assert_eq!(r.signature(), None);
    }

    #[test]
    fn keyring_from_base64() {
        let (_, public) = keypair();
        let mut table = BTreeMap::new();
        table.insert("device:a".to_string(), BASE64.encode(public.to_bytes()));
        let ring = Keyring::from_base64(&table).unwrap();
        assert_eq!(ring.verifying_key("device:a"), Some(public));

        table.insert("device:b".to_string(), "not-a-key".to_string());
        assert!(matches!(
            Keyring::from_base64(&table),
            Err(ConfigError::InvalidKey { actor, .. }) if actor == "device:b"
        ));
    }
}
