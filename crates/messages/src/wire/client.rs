//! Client-facing payloads.

use keygrid_types::{Digest, NodeId, Sealable, ViewNumber};
use serde::{Deserialize, Serialize};

/// A client operation submitted for ordering.
///
/// The consensus layer never parses `operation`; its SHA-256 digest
/// identifies the request for deduplication and commit notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Opaque operation string.
    pub operation: String,
}

impl ClientRequest {
    /// The request digest used for dedup and pending-reply correlation.
    pub fn request_digest(&self) -> Digest {
        Digest::of_bytes(self.operation.as_bytes())
    }
}

/// The outcome of a committed operation, returned to the client gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientReply {
    pub view_number: ViewNumber,
    pub request_digest: Digest,
    pub node: NodeId,
    /// Empty on success, otherwise a short error description.
    pub result: String,
    pub digest: Digest,
}

impl Sealable for ClientReply {
    fn digest(&self) -> &Digest {
        &self.digest
    }
    fn set_digest(&mut self, digest: Digest) {
        self.digest = digest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_digest_tracks_operation_bytes() {
        let a = ClientRequest {
            operation: "op-a".into(),
        };
        let b = ClientRequest {
            operation: "op-b".into(),
        };
        assert_ne!(a.request_digest(), b.request_digest());
        assert_eq!(a.request_digest(), Digest::of_bytes(b"op-a"));
    }

    #[test]
    fn reply_seal_round_trip() {
        let mut reply = ClientReply {
            view_number: ViewNumber(1),
            request_digest: Digest::of_bytes(b"req"),
            node: NodeId(2),
            result: String::new(),
            digest: Digest::zero(),
        };
        reply.seal().unwrap();
        assert!(reply.seal_valid().unwrap());
        reply.result = "late error".into();
        assert!(!reply.seal_valid().unwrap());
    }
}
