//! Keyed hashing for pseudonym tokens.
//!
//! Tokens are derived with HMAC-SHA256 under a per-run key. The same key
//! and canonical value always produce the same digest; without the key the
//! digest cannot be tested against guessed values.

use crate::error::{RedactionError, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

/// Default key identifier when none is configured.
pub const DEFAULT_KEY_ID: &str = "run";

/// Key material for HMAC-SHA256.
#[derive(Clone)]
pub struct KeyMaterial {
    /// The raw key bytes (32 bytes for HMAC-SHA256).
    key: [u8; 32],
    /// Key identifier, reported alongside pseudonym mappings.
    pub key_id: String,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"<redacted>")
            .field("key_id", &self.key_id)
            .finish()
    }
}

impl KeyMaterial {
    /// Create key material from raw bytes.
    pub fn from_bytes(key: [u8; 32], key_id: &str) -> Self {
        Self {
            key,
            key_id: key_id.to_string(),
        }
    }

    /// Derive key material from a run salt (SHA-256 of the salt bytes).
    pub fn from_salt(salt: &str, key_id: &str) -> Result<Self> {
        if salt.is_empty() {
            return Err(RedactionError::KeyError("salt must not be empty".to_string()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(salt.as_bytes()));
        Ok(Self::from_bytes(key, key_id))
    }

    /// Create key material from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str, key_id: &str) -> Result<Self> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| RedactionError::KeyError(format!("invalid base64: {}", e)))?;

        if decoded.len() != 32 {
            return Err(RedactionError::KeyError(format!(
                "key must be 32 bytes, got {}",
                decoded.len()
            )));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&decoded);
        Ok(Self::from_bytes(key, key_id))
    }

    /// Export key material as base64.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.key)
    }

    /// Full HMAC-SHA256 of the given parts, NUL-separated, as lowercase hex.
    pub fn digest_hex(&self, parts: &[&str]) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .map_err(|e| RedactionError::KeyError(e.to_string()))?;
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                mac.update(&[0u8]);
            }
            mac.update(part.as_bytes());
        }
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> KeyMaterial {
        KeyMaterial::from_bytes([7u8; 32], "test")
    }

    #[test]
    fn test_digest_is_deterministic() {
        let k = test_key();
        let a = k.digest_hex(&["PERSON", "john doe"]).unwrap();
        let b = k.digest_hex(&["PERSON", "john doe"]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_digest_separates_parts() {
        let k = test_key();
        let a = k.digest_hex(&["AB", "C"]).unwrap();
        let b = k.digest_hex(&["A", "BC"]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_different_keys_differ() {
        let a = KeyMaterial::from_salt("salt-a", "a").unwrap();
        let b = KeyMaterial::from_salt("salt-b", "b").unwrap();
        assert_ne!(
            a.digest_hex(&["X", "v"]).unwrap(),
            b.digest_hex(&["X", "v"]).unwrap()
        );
    }

    #[test]
    fn test_base64_roundtrip() {
        let k = test_key();
        let restored = KeyMaterial::from_base64(&k.to_base64(), "test").unwrap();
        assert_eq!(
            k.digest_hex(&["X"]).unwrap(),
            restored.digest_hex(&["X"]).unwrap()
        );
    }

    #[test]
    fn test_bad_key_material_rejected() {
        assert!(KeyMaterial::from_base64("not base64!!", "k").is_err());
        assert!(KeyMaterial::from_base64("AAAA", "k").is_err());
        assert!(KeyMaterial::from_salt("", "k").is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let dbg = format!("{:?}", test_key());
        assert!(dbg.contains("<redacted>"));
        assert!(!dbg.contains("7, 7"));
    }
}
