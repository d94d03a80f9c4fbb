//! Normal-case protocol payloads: pre-prepare, prepare, commit.

use crate::signed::Signed;
use keygrid_types::{Digest, NodeId, Sealable, SlotId};
use serde::{Deserialize, Serialize};

/// The primary's ordering assignment for one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub number: SlotId,
    /// SHA-256 of the request carried alongside in the envelope.
    pub request_digest: Digest,
    pub digest: Digest,
}

impl Sealable for PrePrepare {
    fn digest(&self) -> &Digest {
        &self.digest
    }
    fn set_digest(&mut self, digest: Digest) {
        self.digest = digest;
    }
}

/// A signed pre-prepare together with the raw request it orders.
///
/// Only the header is signed; the request is bound to it by
/// `request_digest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrePrepareEnvelope {
    pub preprepare: Signed<PrePrepare>,
    pub request: String,
}

impl PrePrepareEnvelope {
    /// Whether the attached request hashes to the header's digest.
    pub fn request_matches(&self) -> bool {
        Digest::of_bytes(self.request.as_bytes()) == self.preprepare.payload.request_digest
    }
}

/// A backup's vote that it accepted a pre-prepare for this slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prepare {
    pub number: SlotId,
    pub request_digest: Digest,
    pub node: NodeId,
    pub digest: Digest,
}

impl Sealable for Prepare {
    fn digest(&self) -> &Digest {
        &self.digest
    }
    fn set_digest(&mut self, digest: Digest) {
        self.digest = digest;
    }
}

/// A replica's vote that the slot is prepared at `2f` matching replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub number: SlotId,
    pub request_digest: Digest,
    pub node: NodeId,
    pub digest: Digest,
}

impl Sealable for Commit {
    fn digest(&self) -> &Digest {
        &self.digest
    }
    fn set_digest(&mut self, digest: Digest) {
        self.digest = digest;
    }
}
