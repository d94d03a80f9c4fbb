//! Sealable payloads: messages that carry a digest of themselves.
//!
//! The digest field is part of the payload that is itself hashed, so sealing
//! zeroes the field, hashes the canonical encoding, and writes the result
//! back. Verification re-derives the digest on a scratch copy with the field
//! zeroed and compares.

use crate::canonical::{to_canonical_bytes, CodecError};
use crate::digest::Digest;
use serde::Serialize;

/// A payload with an embedded self-digest.
pub trait Sealable: Serialize + Clone {
    /// The current value of the digest field.
    fn digest(&self) -> &Digest;

    /// Overwrite the digest field.
    fn set_digest(&mut self, digest: Digest);

    /// Compute and install the self-digest.
    fn seal(&mut self) -> Result<(), CodecError> {
        self.set_digest(Digest::zero());
        let bytes = to_canonical_bytes(self)?;
        self.set_digest(Digest::of_bytes(&bytes));
        Ok(())
    }

    /// Whether the embedded digest matches the payload.
    fn seal_valid(&self) -> Result<bool, CodecError> {
        let mut scratch = self.clone();
        scratch.set_digest(Digest::zero());
        let bytes = to_canonical_bytes(&scratch)?;
        Ok(*self.digest() == Digest::of_bytes(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Clone)]
    struct Note {
        body: String,
        digest: Digest,
    }

    impl Sealable for Note {
        fn digest(&self) -> &Digest {
            &self.digest
        }
        fn set_digest(&mut self, digest: Digest) {
            self.digest = digest;
        }
    }

    #[test]
    fn seal_then_verify_is_identity() {
        let mut note = Note {
            body: "binding".into(),
            digest: Digest::zero(),
        };
        note.seal().unwrap();
        assert!(!note.digest().is_zero());
        assert!(note.seal_valid().unwrap());
    }

    #[test]
    fn tampering_breaks_the_seal() {
        let mut note = Note {
            body: "binding".into(),
            digest: Digest::zero(),
        };
        note.seal().unwrap();
        note.body = "tampered".into();
        assert!(!note.seal_valid().unwrap());
    }

    #[test]
    fn resealing_is_stable() {
        let mut note = Note {
            body: "stable".into(),
            digest: Digest::zero(),
        };
        note.seal().unwrap();
        let first = *note.digest();
        note.seal().unwrap();
        assert_eq!(first, *note.digest());
    }
}
