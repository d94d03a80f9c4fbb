//! View-change and new-view payloads.

use crate::signed::Signed;
use crate::wire::checkpoint::CheckpointProof;
use crate::wire::three_phase::{PrePrepare, PrePrepareEnvelope, Prepare};
use keygrid_types::{ClusterView, Digest, NodeId, Sealable, SlotId, ViewNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Evidence that a slot was prepared: its pre-prepare plus the collected
/// prepares, together with the original request so a new primary can
/// re-propose it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedProof {
    pub number: SlotId,
    pub request: String,
    pub request_digest: Digest,
    pub preprepare: Signed<PrePrepare>,
    pub prepares: BTreeMap<NodeId, Signed<Prepare>>,
}

impl PreparedProof {
    /// Structural validation: the pre-prepare matches the claimed slot and
    /// digest, and at least `2f` distinct roster prepares agree with it.
    ///
    /// The sender's own prepare vote is implied by it shipping the proof, so
    /// the threshold here counts recorded prepares only.
    pub fn is_well_formed(&self, roster: &ClusterView) -> bool {
        let header = &self.preprepare.payload;
        if header.number != self.number || header.request_digest != self.request_digest {
            return false;
        }
        if Digest::of_bytes(self.request.as_bytes()) != self.request_digest {
            return false;
        }
        if self.preprepare.verify(roster).is_err() {
            return false;
        }
        let matching = self
            .prepares
            .iter()
            .filter(|(node, signed)| {
                signed.payload.number == self.number
                    && signed.payload.request_digest == self.request_digest
                    && signed.payload.node == **node
                    && matches!(signed.verify(roster), Ok(s) if s == **node)
            })
            .count();
        matching >= roster.quorum_2f()
    }
}

/// A replica's vote to move to a higher view, carrying its stable
/// checkpoint and everything prepared-but-not-committed above it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewChange {
    pub view_number: ViewNumber,
    pub checkpoint: SlotId,
    pub checkpoint_proof: CheckpointProof,
    pub prepared_proofs: Vec<PreparedProof>,
    pub node: NodeId,
    pub digest: Digest,
}

impl Sealable for ViewChange {
    fn digest(&self) -> &Digest {
        &self.digest
    }
    fn set_digest(&mut self, digest: Digest) {
        self.digest = digest;
    }
}

/// The new primary's announcement of view `view_number`: the `2f + 1`
/// view-changes it collected and the pre-prepares reconstructed from them.
///
/// A `NewView` with empty `view_changes` and `preprepares` for the sender's
/// current view doubles as the primary heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewView {
    pub view_number: ViewNumber,
    pub view_changes: BTreeMap<NodeId, Signed<ViewChange>>,
    pub preprepares: Vec<PrePrepareEnvelope>,
    pub node: NodeId,
    pub digest: Digest,
}

impl NewView {
    /// Whether this is a periodic heartbeat rather than a view transition.
    pub fn is_heartbeat(&self) -> bool {
        self.view_changes.is_empty() && self.preprepares.is_empty()
    }
}

impl Sealable for NewView {
    fn digest(&self) -> &Digest {
        &self.digest
    }
    fn set_digest(&mut self, digest: Digest) {
        self.digest = digest;
    }
}
