//! Encryption key handling with redacted display and serialization.
//!
//! Provides `SecretKey`, the caller-supplied AES-256 key. It is read from
//! configuration as base64, never printed, never serialized back, and zeroed
//! on drop.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use getset::Getters;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Formatter};
use std::result;
use zeroize::Zeroize;

/// Placeholder text shown instead of the key in logs/debug output
pub static REDACTED_KEY: &str = "###REDACTED_KEY###";

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretKeyError {
    #[error("key must be 32 bytes, got {0}")]
    InvalidLength(usize),
    #[error("key is not valid base64: {0}")]
    InvalidBase64(String),
}

/// A symmetric key that gets redacted in debug output and serialization
#[derive(Clone, Zeroize, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct SecretKey {
    bytes: [u8; KEY_LEN],
}

impl SecretKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_base64<S: AsRef<str>>(encoded: S) -> result::Result<Self, SecretKeyError> {
        let mut decoded = BASE64
            .decode(encoded.as_ref().trim())
            .map_err(|e| SecretKeyError::InvalidBase64(e.to_string()))?;
        let key = Self::try_from(decoded.as_slice());
        decoded.zeroize();
        key
    }

    /// Only for handing a freshly generated key to the operator
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.bytes)
    }
}

impl TryFrom<&[u8]> for SecretKey {
    type Error = SecretKeyError;

    fn try_from(value: &[u8]) -> result::Result<Self, Self::Error> {
        let bytes: [u8; KEY_LEN] = value
            .try_into()
            .map_err(|_| SecretKeyError::InvalidLength(value.len()))?;
        Ok(Self { bytes })
    }
}

impl Debug for SecretKey {
    /// Always shows redacted placeholder instead of actual value
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", REDACTED_KEY)
    }
}

impl Serialize for SecretKey {
    /// Always serializes as redacted placeholder
    fn serialize<S: Serializer>(&self, serializer: S) -> result::Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED_KEY)
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(SecretKeyVisitor)
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

pub struct SecretKeyVisitor;

impl Visitor<'_> for SecretKeyVisitor {
    type Value = SecretKey;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a base64 encoded 32 byte key")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        SecretKey::from_base64(v).map_err(E::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_key_debug_is_redacted() {
        let key = SecretKey::generate();
        assert_eq!(format!("{:?}", key), REDACTED_KEY);
    }

    #[test]
    fn test_secret_key_serialize_is_redacted() {
        let key = SecretKey::generate();
        let serialized = serde_json::to_string(&key).unwrap();
        assert_eq!(serialized, format!("\"{}\"", REDACTED_KEY));
    }

    #[test]
    fn test_secret_key_deserialize_base64() {
        let key = SecretKey::generate();
        let json = format!("\"{}\"", key.to_base64());
        let parsed: SecretKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_secret_key_rejects_wrong_length() {
        let short = BASE64.encode([7u8; 16]);
        assert_eq!(
            SecretKey::from_base64(short),
            Err(SecretKeyError::InvalidLength(16))
        );
        assert!(serde_json::from_str::<SecretKey>("\"AAAA\"").is_err());
    }

    #[test]
    fn test_secret_key_rejects_garbage() {
        assert!(matches!(
            SecretKey::from_base64("not base64 at all!"),
            Err(SecretKeyError::InvalidBase64(_))
        ));
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(SecretKey::generate(), SecretKey::generate());
    }
}
