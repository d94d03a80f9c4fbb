//! Checkpoint and state-transfer payloads.

use crate::signed::Signed;
use keygrid_types::{ClusterView, Digest, NodeId, SlotId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A replica's attestation of its state after delivering `number`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub number: SlotId,
    pub state_digest: Digest,
    pub node: NodeId,
}

/// `2f + 1` matching signed checkpoints; the evidence that a checkpoint is
/// stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CheckpointProof {
    pub checkpoints: BTreeMap<NodeId, Signed<Checkpoint>>,
}

impl CheckpointProof {
    /// The state digest a quorum of distinct, roster-signed checkpoints
    /// attests for `number`, if any.
    pub fn attested_digest(&self, roster: &ClusterView, number: SlotId) -> Option<Digest> {
        let mut counts: BTreeMap<Digest, usize> = BTreeMap::new();
        for (node, signed) in &self.checkpoints {
            if signed.payload.number == number
                && signed.payload.node == *node
                && matches!(signed.verify(roster), Ok(s) if s == *node)
            {
                *counts.entry(signed.payload.state_digest).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .find(|(_, count)| *count >= roster.quorum_2f_plus_one())
            .map(|(digest, _)| digest)
    }

    /// Validate the proof: a quorum of distinct, roster-signed checkpoints
    /// all attesting `(number, state_digest)`.
    pub fn attests(&self, roster: &ClusterView, number: SlotId, state_digest: Digest) -> bool {
        let matching = self
            .checkpoints
            .iter()
            .filter(|(node, signed)| {
                signed.payload.number == number
                    && signed.payload.state_digest == state_digest
                    && signed.payload.node == **node
                    && matches!(signed.verify(roster), Ok(s) if s == **node)
            })
            .count();
        matching >= roster.quorum_2f_plus_one()
    }
}

/// Request for a state snapshot at or above a stable checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub number: SlotId,
    pub node: NodeId,
}

/// A state snapshot with the checkpoint proof that vouches for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotReply {
    pub number: SlotId,
    pub state_digest: Digest,
    pub proof: CheckpointProof,
    /// The collaborator's serialized state.
    pub snapshot: String,
    pub node: NodeId,
}
