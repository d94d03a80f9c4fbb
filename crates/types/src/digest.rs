//! SHA-256 digests with a hex wire representation.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use thiserror::Error;

/// Length of a digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Errors from parsing a hex-encoded digest.
#[derive(Debug, Error)]
pub enum HexError {
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("wrong length: expected {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
}

/// A SHA-256 digest.
///
/// The all-zero digest is reserved as the placeholder value written into a
/// payload's digest field while the payload itself is being hashed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// The all-zero placeholder digest.
    pub const fn zero() -> Self {
        Self([0u8; DIGEST_LEN])
    }

    /// SHA-256 of a byte string.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Construct from raw bytes.
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Whether this is the all-zero placeholder.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; DIGEST_LEN]
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Extend a running hash chain: `H(self || next)`.
    pub fn chain(&self, next: &Digest) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(next.0);
        Self(hasher.finalize().into())
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; DIGEST_LEN] =
            bytes
                .try_into()
                .map_err(|rejected: Vec<u8>| HexError::WrongLength {
                    expected: DIGEST_LEN,
                    actual: rejected.len(),
                })?;
        Ok(Self(arr))
    }

    /// Encode as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for log readability.
        write!(f, "{}…", &self.to_hex()[..8])
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_bytes_is_stable() {
        let a = Digest::of_bytes(b"hello");
        let b = Digest::of_bytes(b"hello");
        assert_eq!(a, b);
        assert_ne!(a, Digest::of_bytes(b"world"));
    }

    #[test]
    fn zero_is_placeholder() {
        assert!(Digest::zero().is_zero());
        assert!(!Digest::of_bytes(b"").is_zero());
    }

    #[test]
    fn hex_round_trip() {
        let d = Digest::of_bytes(b"round trip");
        let parsed = Digest::from_hex(&d.to_hex()).unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn hex_rejects_wrong_length() {
        assert!(matches!(
            Digest::from_hex("abcd"),
            Err(HexError::WrongLength { .. })
        ));
    }

    #[test]
    fn hex_rejects_non_hex() {
        assert!(matches!(
            Digest::from_hex("zz"),
            Err(HexError::InvalidHex(_))
        ));
    }

    #[test]
    fn chain_depends_on_order() {
        let a = Digest::of_bytes(b"a");
        let b = Digest::of_bytes(b"b");
        assert_ne!(a.chain(&b), b.chain(&a));
        // Chaining is deterministic.
        assert_eq!(a.chain(&b), a.chain(&b));
    }

    #[test]
    fn serde_uses_the_hex_form() {
        let d = Digest::of_bytes(b"wire");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d.to_hex()));
        let parsed: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(d, parsed);
    }
}
