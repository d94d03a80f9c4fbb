//! Ed25519 keys, detached signatures, and roster fingerprints.
//!
//! Protocol messages are signed with a detached signature over the canonical
//! JSON encoding of the payload. Verification resolves the signer by key
//! fingerprint against the cluster roster, so a wrapper is only accepted if
//! its key belongs to a known replica.

use crate::canonical::{to_canonical_bytes, CodecError};
use crate::digest::Digest;
use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Errors from signing or verifying protocol messages.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signature does not verify")]
    BadSignature,
    #[error("signing key fingerprint {0} is not in the roster")]
    UnknownSigner(Fingerprint),
    #[error("malformed key material: {0}")]
    MalformedKey(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// SHA-256 fingerprint of a public key, used to look up signers in the roster.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(Digest);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fp:{:?}", self.0)
    }
}

/// An Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// The key's roster fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(Digest::of_bytes(self.0.as_bytes()))
    }

    /// Parse from a hex string (the form stored in the cluster config).
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::MalformedKey("public key must be 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&arr)
            .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
        Ok(Self(key))
    }

    /// Encode as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Verify a detached signature over the canonical encoding of `payload`.
    pub fn verify_canonical<T: Serialize>(
        &self,
        payload: &T,
        signature: &Signature,
    ) -> Result<(), CryptoError> {
        let bytes = to_canonical_bytes(payload)?;
        self.0
            .verify(&bytes, &signature.0)
            .map_err(|_| CryptoError::BadSignature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pk:{}…", &self.to_hex()[..8])
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| CryptoError::MalformedKey("signature must be 64 bytes".into()))?;
        Ok(Self(ed25519_dalek::Signature::from_bytes(&arr)))
    }

    /// Encode as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig:{}…", &self.to_hex()[..8])
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Signature::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// An Ed25519 signing key with its derived verifying key.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            signing: SigningKey::generate(&mut rng),
        }
    }

    /// Deterministic keypair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Parse the seed from a hex string (the on-disk key file form).
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::MalformedKey("signing key must be 32 bytes".into()))?;
        Ok(Self::from_seed(&arr))
    }

    /// Encode the seed as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    /// The corresponding verifying key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }

    /// The roster fingerprint of the verifying key.
    pub fn fingerprint(&self) -> Fingerprint {
        self.public_key().fingerprint()
    }

    /// Produce a detached signature over the canonical encoding of `payload`.
    pub fn sign_canonical<T: Serialize>(&self, payload: &T) -> Result<Signature, CodecError> {
        let bytes = to_canonical_bytes(payload)?;
        Ok(Signature(self.signing.sign(&bytes)))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({:?})", self.public_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize, Clone)]
    struct Payload {
        view: u64,
        body: &'static str,
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let kp = KeyPair::from_seed(&[7u8; 32]);
        let payload = Payload { view: 3, body: "x" };
        let sig = kp.sign_canonical(&payload).unwrap();
        assert!(kp.public_key().verify_canonical(&payload, &sig).is_ok());
    }

    #[test]
    fn tampered_payload_fails() {
        let kp = KeyPair::from_seed(&[7u8; 32]);
        let sig = kp
            .sign_canonical(&Payload { view: 3, body: "x" })
            .unwrap();
        let err = kp
            .public_key()
            .verify_canonical(&Payload { view: 4, body: "x" }, &sig)
            .unwrap_err();
        assert!(matches!(err, CryptoError::BadSignature));
    }

    #[test]
    fn wrong_key_fails() {
        let signer = KeyPair::from_seed(&[1u8; 32]);
        let other = KeyPair::from_seed(&[2u8; 32]);
        let payload = Payload { view: 1, body: "y" };
        let sig = signer.sign_canonical(&payload).unwrap();
        assert!(other.public_key().verify_canonical(&payload, &sig).is_err());
    }

    #[test]
    fn key_hex_round_trip() {
        let kp = KeyPair::from_seed(&[9u8; 32]);
        let restored = KeyPair::from_hex(&kp.to_hex()).unwrap();
        assert_eq!(kp.fingerprint(), restored.fingerprint());

        let pk = PublicKey::from_hex(&kp.public_key().to_hex()).unwrap();
        assert_eq!(pk, kp.public_key());
    }

    #[test]
    fn fingerprints_distinguish_keys() {
        let a = KeyPair::from_seed(&[1u8; 32]);
        let b = KeyPair::from_seed(&[2u8; 32]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
