//! The signed message wrapper.

use keygrid_types::{ClusterView, CodecError, CryptoError, Fingerprint, KeyPair, NodeId, Signature};
use serde::{Deserialize, Serialize};

/// A payload plus a detached signature over its canonical encoding.
///
/// The wrapper carries the signer's key fingerprint so verification can
/// resolve the signing replica against the roster; a wrapper whose key is
/// not in the roster is rejected outright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signed<T> {
    pub payload: T,
    pub fingerprint: Fingerprint,
    pub signature: Signature,
}

impl<T: Serialize> Signed<T> {
    /// Sign `payload` with the replica's key.
    pub fn sign(payload: T, keypair: &KeyPair) -> Result<Self, CodecError> {
        let signature = keypair.sign_canonical(&payload)?;
        Ok(Self {
            payload,
            fingerprint: keypair.fingerprint(),
            signature,
        })
    }

    /// Verify the signature against the roster and return the signing node.
    pub fn verify(&self, roster: &ClusterView) -> Result<NodeId, CryptoError> {
        let node = roster
            .node_by_fingerprint(&self.fingerprint)
            .ok_or(CryptoError::UnknownSigner(self.fingerprint))?;
        let key = roster
            .public_key(node)
            .ok_or(CryptoError::UnknownSigner(self.fingerprint))?;
        key.verify_canonical(&self.payload, &self.signature)?;
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygrid_types::test_utils::{test_keypair, test_view};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        view: u64,
    }

    #[test]
    fn roster_member_verifies() {
        let roster = test_view(4, 0);
        let signed = Signed::sign(Ping { view: 2 }, &test_keypair(1)).unwrap();
        assert_eq!(signed.verify(&roster).unwrap(), NodeId(1));
    }

    #[test]
    fn stranger_key_is_rejected() {
        let roster = test_view(4, 0);
        let signed = Signed::sign(Ping { view: 2 }, &test_keypair(42)).unwrap();
        assert!(matches!(
            signed.verify(&roster),
            Err(CryptoError::UnknownSigner(_))
        ));
    }

    #[test]
    fn forged_signature_is_rejected() {
        let roster = test_view(4, 0);
        // Claim node 2's fingerprint but sign with a key outside the roster.
        let mut signed = Signed::sign(Ping { view: 2 }, &test_keypair(42)).unwrap();
        signed.fingerprint = test_keypair(2).fingerprint();
        assert!(matches!(
            signed.verify(&roster),
            Err(CryptoError::BadSignature)
        ));
    }

    #[test]
    fn payload_tampering_is_rejected() {
        let roster = test_view(4, 0);
        let mut signed = Signed::sign(Ping { view: 2 }, &test_keypair(1)).unwrap();
        signed.payload.view = 3;
        assert!(matches!(
            signed.verify(&roster),
            Err(CryptoError::BadSignature)
        ));
    }

    #[test]
    fn wrapper_survives_json_round_trip() {
        let roster = test_view(4, 0);
        let signed = Signed::sign(Ping { view: 9 }, &test_keypair(3)).unwrap();
        let json = serde_json::to_string(&signed).unwrap();
        let parsed: Signed<Ping> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.verify(&roster).unwrap(), NodeId(3));
    }
}
