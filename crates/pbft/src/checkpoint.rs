//! Checkpoint vote collection and stability tracking.

use keygrid_messages::{Checkpoint, CheckpointProof, Signed};
use keygrid_types::{ClusterView, Digest, NodeId, SlotId};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// The replica's last stable checkpoint with its quorum proof.
///
/// A fresh replica starts at the genesis checkpoint: slot `(0, 0)`, the
/// zero state digest, and an empty proof.
#[derive(Debug, Clone, Default)]
pub struct StableCheckpoint {
    pub number: SlotId,
    pub state_digest: Digest,
    pub proof: CheckpointProof,
}

/// Collects signed checkpoint attestations until `2f + 1` agree.
///
/// Votes are keyed by `(slot, state_digest)`: a Byzantine replica attesting
/// a different digest for the same slot accumulates in a separate bucket and
/// can never help it stabilize.
#[derive(Debug, Clone, Default)]
pub struct CheckpointLedger {
    stable: StableCheckpoint,
    votes: HashMap<(SlotId, Digest), BTreeMap<NodeId, Signed<Checkpoint>>>,
}

impl CheckpointLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last stable checkpoint.
    pub fn stable(&self) -> &StableCheckpoint {
        &self.stable
    }

    /// The low watermark: the stable checkpoint's sequence number.
    pub fn low_watermark(&self) -> u64 {
        self.stable.number.seq_number.0
    }

    /// Record one attestation. Returns the new stable checkpoint if this
    /// vote completed a quorum above the current one.
    pub fn record(
        &mut self,
        node: NodeId,
        signed: Signed<Checkpoint>,
        roster: &ClusterView,
    ) -> Option<StableCheckpoint> {
        let number = signed.payload.number;
        let state_digest = signed.payload.state_digest;
        if number <= self.stable.number {
            return None;
        }

        let bucket = self.votes.entry((number, state_digest)).or_default();
        if bucket.insert(node, signed).is_none() {
            debug!(
                checkpoint = %number,
                votes = bucket.len(),
                "checkpoint attestation recorded"
            );
        }
        if bucket.len() < roster.quorum_2f_plus_one() {
            return None;
        }

        let proof = CheckpointProof {
            checkpoints: bucket.clone(),
        };
        let stable = StableCheckpoint {
            number,
            state_digest,
            proof,
        };
        self.install(stable.clone());
        Some(stable)
    }

    /// Adopt a stable checkpoint (from a local quorum or a verified
    /// snapshot proof) and drop votes it supersedes.
    pub fn install(&mut self, stable: StableCheckpoint) {
        if stable.number <= self.stable.number {
            return;
        }
        self.votes.retain(|(number, _), _| *number > stable.number);
        self.stable = stable;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygrid_types::test_utils::{test_keypair, test_view};
    use keygrid_types::{SeqNumber, ViewNumber};

    fn slot(seq: u64) -> SlotId {
        SlotId::new(ViewNumber(0), SeqNumber(seq))
    }

    fn attestation(seq: u64, digest: Digest, node: u8) -> Signed<Checkpoint> {
        Signed::sign(
            Checkpoint {
                number: slot(seq),
                state_digest: digest,
                node: NodeId(node as u32),
            },
            &test_keypair(node),
        )
        .unwrap()
    }

    #[test]
    fn quorum_of_matching_votes_stabilizes() {
        let roster = test_view(4, 0);
        let mut ledger = CheckpointLedger::new();
        let digest = Digest::of_bytes(b"state");

        assert!(ledger
            .record(NodeId(0), attestation(10, digest, 0), &roster)
            .is_none());
        assert!(ledger
            .record(NodeId(1), attestation(10, digest, 1), &roster)
            .is_none());
        let stable = ledger
            .record(NodeId(2), attestation(10, digest, 2), &roster)
            .expect("third matching vote stabilizes");
        assert_eq!(stable.number, slot(10));
        assert_eq!(ledger.low_watermark(), 10);
        assert_eq!(stable.proof.checkpoints.len(), 3);
    }

    #[test]
    fn mismatched_digests_do_not_combine() {
        let roster = test_view(4, 0);
        let mut ledger = CheckpointLedger::new();
        let a = Digest::of_bytes(b"a");
        let b = Digest::of_bytes(b"b");

        ledger.record(NodeId(0), attestation(10, a, 0), &roster);
        ledger.record(NodeId(1), attestation(10, a, 1), &roster);
        assert!(ledger
            .record(NodeId(2), attestation(10, b, 2), &roster)
            .is_none());
        assert_eq!(ledger.low_watermark(), 0);
    }

    #[test]
    fn duplicate_votes_count_once() {
        let roster = test_view(4, 0);
        let mut ledger = CheckpointLedger::new();
        let digest = Digest::of_bytes(b"state");

        ledger.record(NodeId(1), attestation(10, digest, 1), &roster);
        assert!(ledger
            .record(NodeId(1), attestation(10, digest, 1), &roster)
            .is_none());
        assert!(ledger
            .record(NodeId(1), attestation(10, digest, 1), &roster)
            .is_none());
    }

    #[test]
    fn stale_attestations_are_ignored() {
        let roster = test_view(4, 0);
        let mut ledger = CheckpointLedger::new();
        let digest = Digest::of_bytes(b"state");
        for n in 0..3u8 {
            ledger.record(NodeId(n as u32), attestation(10, digest, n), &roster);
        }
        assert_eq!(ledger.low_watermark(), 10);
        assert!(ledger
            .record(NodeId(3), attestation(5, digest, 3), &roster)
            .is_none());
        assert_eq!(ledger.low_watermark(), 10);
    }

    #[test]
    fn install_supersedes_pending_votes() {
        let roster = test_view(4, 0);
        let mut ledger = CheckpointLedger::new();
        let digest = Digest::of_bytes(b"state");
        ledger.record(NodeId(0), attestation(10, digest, 0), &roster);

        ledger.install(StableCheckpoint {
            number: slot(20),
            state_digest: digest,
            proof: CheckpointProof::default(),
        });
        assert_eq!(ledger.low_watermark(), 20);

        // Earlier votes were dropped; a late vote for slot 10 cannot regress.
        ledger.record(NodeId(1), attestation(10, digest, 1), &roster);
        ledger.record(NodeId(2), attestation(10, digest, 2), &roster);
        assert!(ledger
            .record(NodeId(3), attestation(10, digest, 3), &roster)
            .is_none());
        assert_eq!(ledger.low_watermark(), 20);
    }
}
