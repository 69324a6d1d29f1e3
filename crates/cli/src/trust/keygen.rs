use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{SigningKey, VerifyingKey};

/// Paths written by [`write_keypair`].
pub struct KeyFiles {
    pub secret: String,
    pub public: String,
    pub fingerprint: String,
}

/// Generate an Ed25519 keypair and write `<prefix>.secret` (base64 32-byte
/// seed, mode 0600 on Unix) and `<prefix>.pub` (base64 verifying key).
///
/// The `.pub` contents are what goes into the `[keys]` table of
/// `declog.toml`.
pub fn write_keypair(prefix: &str) -> Result<KeyFiles, String> {
    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let verifying_key = signing_key.verifying_key();

    let secret = format!("{}.secret", prefix);
    std::fs::write(&secret, BASE64.encode(signing_key.to_bytes()))
        .map_err(|e| format!("error writing secret key to '{}': {}", secret, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(&secret, std::fs::Permissions::from_mode(0o600)) {
            tracing::warn!(path = %secret, error = %e, "could not restrict secret key permissions");
        }
    }

    let public = format!("{}.pub", prefix);
    std::fs::write(&public, BASE64.encode(verifying_key.to_bytes()))
        .map_err(|e| format!("error writing public key to '{}': {}", public, e))?;

    Ok(KeyFiles {
        secret,
        public,
        fingerprint: key_fingerprint(&verifying_key),
    })
}

/// Read a `.secret` file (base64 32-byte Ed25519 seed).
pub fn read_secret_key(path: &Path) -> Result<SigningKey, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("error reading secret key '{}': {}", path.display(), e))?;
    let bytes = BASE64
        .decode(contents.trim())
        .map_err(|e| format!("error decoding secret key '{}': {}", path.display(), e))?;
    let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| {
        format!(
            "invalid secret key length in '{}': expected 32 bytes",
            path.display()
        )
    })?;
    Ok(SigningKey::from_bytes(&key_bytes))
}

/// First 8 key bytes as hex.
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    key.to_bytes()[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
