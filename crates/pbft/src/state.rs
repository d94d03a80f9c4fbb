//! The PBFT replica state machine.
//!
//! This module owns the normal-case three-phase protocol; view changes live
//! in [`crate::view_change`] and checkpoint collection in
//! [`crate::checkpoint`].
//!
//! # State machine per slot
//!
//! ```text
//! Empty → HavePP → Prepared → Committed      (monotonic, no back-edges)
//! ```
//!
//! A replica counts its own prepare and commit votes toward quorums. The
//! primary never sends itself a `Prepare` over the wire; its pre-prepare
//! implicitly constitutes its prepare vote, recorded locally as one.

use keygrid_core::{Action, Event, OutboundMessage, StateMachine, TimerId};
use keygrid_messages::{
    Checkpoint, ClientRequest, Commit, PrePrepare, PrePrepareEnvelope, Prepare, Signed,
    SnapshotReply, SnapshotRequest,
};
use keygrid_types::{
    ClusterView, CodecError, Digest, KeyPair, NodeId, Sealable, SeqNumber, SlotId, ViewNumber,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, error, info, trace, warn};

use crate::checkpoint::{CheckpointLedger, StableCheckpoint};
use crate::config::PbftConfig;
use crate::log::SlotStore;
use crate::view_change::ViewChangeStatus;

/// PBFT replica state.
///
/// Handles client requests, the three voting rounds per slot, quorum
/// detection, in-order delivery, checkpointing, and (via the companion
/// module) view changes.
///
/// # State Machine Flow
///
/// 1. **Client request** → primary assigns the next slot and pre-prepares
/// 2. **Pre-prepare received** → backup validates, records, prepares
/// 3. **Prepare received** → collect; at 2f (self included) latch prepared,
///    commit
/// 4. **Commit received** → collect; at 2f+1 latch committed, deliver in
///    ascending sequence order
/// 5. **Suspicion timer** → backup starts a view change
pub struct ReplicaState {
    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════
    pub(crate) roster: ClusterView,
    pub(crate) keypair: KeyPair,
    pub(crate) config: PbftConfig,

    // ═══════════════════════════════════════════════════════════════════════
    // Protocol state
    // ═══════════════════════════════════════════════════════════════════════
    /// Current leadership epoch.
    pub(crate) view_number: ViewNumber,

    /// Highest sequence number this replica has seen assigned; the primary
    /// allocates `issued + 1` for a fresh request.
    pub(crate) issued_seq_number: SeqNumber,

    /// Highest committed sequence number.
    pub(crate) sequence_number: SeqNumber,

    /// Highest contiguously delivered sequence number.
    pub(crate) delivered: SeqNumber,

    /// Running hash chain over delivered request digests; the checkpoint
    /// state digest.
    pub(crate) state_digest: Digest,

    pub(crate) log: SlotStore,
    pub(crate) checkpoints: CheckpointLedger,
    pub(crate) view_change: ViewChangeStatus,

    /// Request digests already seen; drives client-request dedup.
    pub(crate) known_digests: HashSet<Digest>,

    /// Requests this backup forwarded and is awaiting commit for.
    pub(crate) pending_requests: HashSet<Digest>,

    /// Committed but not yet deliverable operations, keyed by sequence.
    pending_delivery: BTreeMap<u64, (SlotId, Digest, String)>,

    /// Peers whose snapshot requests await the collaborator's bytes.
    pending_snapshot_requests: Vec<(NodeId, SlotId)>,

    /// While fetching a snapshot the commit pointer must not advance.
    pub(crate) fetching_snapshot: Option<SlotId>,
}

impl std::fmt::Debug for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaState")
            .field("node", &self.roster.local_id())
            .field("view", &self.view_number)
            .field("issued", &self.issued_seq_number)
            .field("committed", &self.sequence_number)
            .field("delivered", &self.delivered)
            .field("log_slots", &self.log.len())
            .field("view_change", &self.view_change.in_progress)
            .finish()
    }
}

impl ReplicaState {
    pub fn new(roster: ClusterView, keypair: KeyPair, config: PbftConfig) -> Self {
        Self {
            roster,
            keypair,
            config,
            view_number: ViewNumber(0),
            issued_seq_number: SeqNumber(0),
            sequence_number: SeqNumber(0),
            delivered: SeqNumber(0),
            state_digest: Digest::zero(),
            log: SlotStore::new(),
            checkpoints: CheckpointLedger::new(),
            view_change: ViewChangeStatus::default(),
            known_digests: HashSet::new(),
            pending_requests: HashSet::new(),
            pending_delivery: BTreeMap::new(),
            pending_snapshot_requests: Vec::new(),
            fetching_snapshot: None,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn local_id(&self) -> NodeId {
        self.roster.local_id()
    }

    pub fn view_number(&self) -> ViewNumber {
        self.view_number
    }

    /// Highest committed sequence number.
    pub fn sequence_number(&self) -> SeqNumber {
        self.sequence_number
    }

    /// Highest contiguously delivered sequence number.
    pub fn delivered(&self) -> SeqNumber {
        self.delivered
    }

    pub fn state_digest(&self) -> Digest {
        self.state_digest
    }

    pub fn roster(&self) -> &ClusterView {
        &self.roster
    }

    pub fn log(&self) -> &SlotStore {
        &self.log
    }

    pub fn stable_checkpoint(&self) -> &StableCheckpoint {
        self.checkpoints.stable()
    }

    pub fn view_change_in_progress(&self) -> bool {
        self.view_change.in_progress
    }

    /// Whether this replica leads the current view.
    pub fn is_primary(&self) -> bool {
        self.roster.is_local_leader(self.view_number)
    }

    pub(crate) fn suspicion_duration(&self) -> std::time::Duration {
        self.config.suspicion_interval(self.roster.size())
    }

    /// Whether a slot sits in `(h, h + 2·CHECKPOINT_INTERVAL]` around the
    /// last stable checkpoint.
    fn in_watermark_window(&self, number: SlotId) -> bool {
        let seq = number.seq_number.0;
        let low = self.checkpoints.low_watermark();
        let high = low + PbftConfig::WATERMARK_WINDOW_INTERVALS * self.config.checkpoint_interval;
        seq > low && seq <= high
    }

    /// Arm the role-appropriate liveness timer at startup.
    pub fn initialize(&self) -> Vec<Action> {
        info!(
            node = %self.local_id(),
            n = self.roster.size(),
            f = self.roster.max_faulty(),
            primary = self.is_primary(),
            "replica initialized"
        );
        if self.is_primary() {
            vec![Action::SetTimer {
                id: TimerId::Heartbeat,
                duration: self.config.heartbeat_interval,
            }]
        } else {
            vec![Action::SetTimer {
                id: TimerId::Suspicion,
                duration: self.suspicion_duration(),
            }]
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Client requests
    // ═══════════════════════════════════════════════════════════════════════

    /// A locally proposed operation (from the collaborator).
    pub fn on_propose(&mut self, operation: String) -> Vec<Action> {
        if operation.is_empty() {
            // The empty request is reserved for reconstructed no-op slots.
            warn!(node = %self.local_id(), "dropping empty proposal");
            return vec![];
        }
        self.on_client_request(operation)
    }

    /// A client request forwarded over the wire.
    pub fn on_client_request_received(&mut self, request: Signed<ClientRequest>) -> Vec<Action> {
        let signer = match request.verify(&self.roster) {
            Ok(signer) => signer,
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "invalid client request signature");
                return vec![];
            }
        };
        trace!(node = %self.local_id(), from = %signer, "client request received");
        self.on_client_request(request.payload.operation)
    }

    fn on_client_request(&mut self, operation: String) -> Vec<Action> {
        if self.view_change.in_progress {
            debug!(node = %self.local_id(), "dropping client request during view change");
            return vec![];
        }

        let request_digest = Digest::of_bytes(operation.as_bytes());
        if self.known_digests.contains(&request_digest) {
            debug!(
                node = %self.local_id(),
                request = ?request_digest,
                "duplicate client request dropped"
            );
            return vec![];
        }

        if self.is_primary() {
            return self.assign_slot(operation, request_digest);
        }

        // Backups forward to the primary and watch for the commit.
        self.known_digests.insert(request_digest);
        self.pending_requests.insert(request_digest);
        let primary = self.roster.leader_for(self.view_number);
        let request = ClientRequest { operation };
        let signed = match Signed::sign(request, &self.keypair) {
            Ok(signed) => signed,
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "failed to sign forwarded request");
                return vec![];
            }
        };
        debug!(
            node = %self.local_id(),
            primary = %primary,
            request = ?request_digest,
            "forwarding client request to primary"
        );
        vec![
            Action::SendTo {
                node: primary,
                message: OutboundMessage::ClientRequest(signed),
            },
            Action::SetTimer {
                id: TimerId::Request(request_digest),
                duration: self.config.request_timeout,
            },
        ]
    }

    /// Primary path: allocate the next slot and pre-prepare it.
    fn assign_slot(&mut self, operation: String, request_digest: Digest) -> Vec<Action> {
        let seq = self.issued_seq_number.next();
        self.issued_seq_number = seq;
        let number = SlotId::new(self.view_number, seq);

        let mut header = PrePrepare {
            number,
            request_digest,
            digest: Digest::zero(),
        };
        if let Err(e) = header.seal() {
            warn!(node = %self.local_id(), error = %e, "failed to seal pre-prepare");
            return vec![];
        }
        let preprepare = match Signed::sign(header, &self.keypair) {
            Ok(signed) => signed,
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "failed to sign pre-prepare");
                return vec![];
            }
        };
        let self_prepare = match self.make_prepare(number, request_digest) {
            Ok(prepare) => prepare,
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "failed to build self-prepare");
                return vec![];
            }
        };

        self.known_digests.insert(request_digest);
        let local = self.local_id();
        let slot = self.log.ensure(number);
        slot.request = Some(operation.clone());
        slot.request_digest = Some(request_digest);
        slot.preprepare = Some(preprepare.clone());
        slot.prepares.insert(local, self_prepare);

        info!(
            node = %local,
            slot = %number,
            request = ?request_digest,
            "assigned slot, broadcasting pre-prepare"
        );
        let envelope = PrePrepareEnvelope {
            preprepare,
            request: operation,
        };
        let mut actions = vec![Action::Broadcast {
            message: OutboundMessage::PrePrepare(envelope),
        }];
        // A prepare quorum can already exist for tiny clusters (2f = 0 never
        // happens at N ≥ 4, but out-of-order prepares may be buffered).
        actions.extend(self.try_advance(number));
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Three-phase handlers
    // ═══════════════════════════════════════════════════════════════════════

    pub fn on_preprepare(&mut self, envelope: PrePrepareEnvelope) -> Vec<Action> {
        if self.view_change.in_progress {
            debug!(node = %self.local_id(), "dropping pre-prepare during view change");
            return vec![];
        }
        if self.is_primary() {
            trace!(node = %self.local_id(), "primary ignores incoming pre-prepares");
            return vec![];
        }

        let signer = match envelope.preprepare.verify(&self.roster) {
            Ok(signer) => signer,
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "invalid pre-prepare signature");
                return vec![];
            }
        };
        let header = envelope.preprepare.payload.clone();
        match header.seal_valid() {
            Ok(true) => {}
            Ok(false) => {
                warn!(node = %self.local_id(), slot = %header.number, "pre-prepare self-digest invalid");
                return vec![];
            }
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "pre-prepare digest check failed");
                return vec![];
            }
        }
        if !envelope.request_matches() {
            warn!(
                node = %self.local_id(),
                slot = %header.number,
                "pre-prepare request does not hash to its digest"
            );
            return vec![];
        }

        if !self.in_watermark_window(header.number) {
            warn!(
                node = %self.local_id(),
                slot = %header.number,
                low = self.checkpoints.low_watermark(),
                "pre-prepare outside watermark window"
            );
            return vec![];
        }

        if header.number.view_number != self.view_number {
            debug!(
                node = %self.local_id(),
                slot = %header.number,
                view = %self.view_number,
                "pre-prepare for a different view"
            );
            return vec![];
        }
        if signer != self.roster.leader_for(header.number.view_number) {
            warn!(
                node = %self.local_id(),
                signer = %signer,
                slot = %header.number,
                "pre-prepare not signed by the view's primary"
            );
            return vec![];
        }

        // Idempotency and equivocation.
        if let Some(slot) = self.log.get(&header.number) {
            if let Some(existing) = &slot.preprepare {
                if existing.payload.request_digest == header.request_digest {
                    trace!(node = %self.local_id(), slot = %header.number, "duplicate pre-prepare");
                } else {
                    error!(
                        node = %self.local_id(),
                        slot = %header.number,
                        held = ?existing.payload.request_digest,
                        offered = ?header.request_digest,
                        "conflicting pre-prepare digest for slot"
                    );
                }
                return vec![];
            }
        }

        // A valid message from the current primary: push the suspicion timer.
        let mut actions = vec![Action::SetTimer {
            id: TimerId::Suspicion,
            duration: self.suspicion_duration(),
        }];

        let self_prepare = match self.make_prepare(header.number, header.request_digest) {
            Ok(prepare) => prepare,
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "failed to build prepare");
                return actions;
            }
        };

        if header.number.seq_number > self.issued_seq_number {
            self.issued_seq_number = header.number.seq_number;
        }
        self.known_digests.insert(header.request_digest);
        let local = self.local_id();
        let slot = self.log.ensure(header.number);
        slot.request = Some(envelope.request);
        slot.request_digest = Some(header.request_digest);
        slot.preprepare = Some(envelope.preprepare);
        slot.prepares.insert(local, self_prepare.clone());

        debug!(
            node = %local,
            slot = %header.number,
            request = ?header.request_digest,
            "accepted pre-prepare, broadcasting prepare"
        );
        actions.push(Action::Broadcast {
            message: OutboundMessage::Prepare(self_prepare),
        });
        // Prepares buffered ahead of the pre-prepare may already complete
        // the quorum.
        actions.extend(self.try_advance(header.number));
        actions
    }

    pub fn on_prepare(&mut self, prepare: Signed<Prepare>) -> Vec<Action> {
        if self.view_change.in_progress {
            debug!(node = %self.local_id(), "dropping prepare during view change");
            return vec![];
        }
        let signer = match self.verify_vote(&prepare, prepare.payload.node, "prepare") {
            Some(signer) => signer,
            None => return vec![],
        };
        let number = prepare.payload.number;
        if !self.in_watermark_window(number) {
            trace!(node = %self.local_id(), slot = %number, "prepare outside watermark window");
            return vec![];
        }

        let slot = self.log.ensure(number);
        if let Some(held) = slot.request_digest {
            if held != prepare.payload.request_digest {
                warn!(
                    node = %signer,
                    slot = %number,
                    held = ?held,
                    offered = ?prepare.payload.request_digest,
                    "prepare digest disagrees with slot"
                );
                return vec![];
            }
        }
        if slot.prepares.contains_key(&signer) {
            trace!(node = %self.local_id(), from = %signer, slot = %number, "duplicate prepare");
            return vec![];
        }
        slot.prepares.insert(signer, prepare);
        self.try_advance(number)
    }

    pub fn on_commit(&mut self, commit: Signed<Commit>) -> Vec<Action> {
        if self.view_change.in_progress {
            debug!(node = %self.local_id(), "dropping commit during view change");
            return vec![];
        }
        let signer = match self.verify_vote(&commit, commit.payload.node, "commit") {
            Some(signer) => signer,
            None => return vec![],
        };
        let number = commit.payload.number;
        if !self.in_watermark_window(number) {
            trace!(node = %self.local_id(), slot = %number, "commit outside watermark window");
            return vec![];
        }

        let slot = self.log.ensure(number);
        if let Some(held) = slot.request_digest {
            if held != commit.payload.request_digest {
                warn!(
                    node = %signer,
                    slot = %number,
                    held = ?held,
                    offered = ?commit.payload.request_digest,
                    "commit digest disagrees with slot"
                );
                return vec![];
            }
        }
        if slot.commits.contains_key(&signer) {
            trace!(node = %self.local_id(), from = %signer, slot = %number, "duplicate commit");
            return vec![];
        }
        slot.commits.insert(signer, commit);
        self.try_advance(number)
    }

    /// Signature, seal, and claimed-sender checks shared by prepare and
    /// commit votes.
    fn verify_vote<T: Sealable>(
        &self,
        signed: &Signed<T>,
        claimed: NodeId,
        kind: &str,
    ) -> Option<NodeId> {
        let signer = match signed.verify(&self.roster) {
            Ok(signer) => signer,
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "invalid {kind} signature");
                return None;
            }
        };
        if signer != claimed {
            warn!(
                node = %self.local_id(),
                signer = %signer,
                claimed = %claimed,
                "{kind} signer does not match claimed sender"
            );
            return None;
        }
        match signed.payload.seal_valid() {
            Ok(true) => Some(signer),
            Ok(false) => {
                warn!(node = %self.local_id(), from = %signer, "{kind} self-digest invalid");
                None
            }
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "{kind} digest check failed");
                None
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Quorum detection and delivery
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn try_advance(&mut self, number: SlotId) -> Vec<Action> {
        let mut actions = self.try_latch_prepared(number);
        actions.extend(self.try_latch_committed(number));
        actions
    }

    fn try_latch_prepared(&mut self, number: SlotId) -> Vec<Action> {
        let quorum = self.roster.quorum_2f();
        let request_digest = match self.log.get(&number) {
            Some(slot) if !slot.prepared && slot.has_prepare_quorum(quorum) => {
                match slot.request_digest {
                    Some(digest) => digest,
                    None => return vec![],
                }
            }
            _ => return vec![],
        };

        let commit = match self.make_commit(number, request_digest) {
            Ok(commit) => commit,
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "failed to build commit");
                return vec![];
            }
        };
        let local = self.local_id();
        if let Some(slot) = self.log.get_mut(&number) {
            slot.prepared = true;
            slot.commits.insert(local, commit.clone());
        }
        info!(node = %local, slot = %number, "slot prepared, broadcasting commit");
        vec![Action::Broadcast {
            message: OutboundMessage::Commit(commit),
        }]
    }

    fn try_latch_committed(&mut self, number: SlotId) -> Vec<Action> {
        let quorum = self.roster.quorum_2f_plus_one();
        let (request_digest, request) = match self.log.get(&number) {
            Some(slot) if !slot.committed && slot.has_commit_quorum(quorum) => {
                match (slot.request_digest, &slot.request) {
                    (Some(digest), Some(request)) => (digest, request.clone()),
                    _ => return vec![],
                }
            }
            _ => return vec![],
        };

        if let Some(slot) = self.log.get_mut(&number) {
            slot.committed = true;
        }
        let seq = number.seq_number;
        if seq > self.sequence_number {
            self.sequence_number = seq;
        }
        if seq > self.issued_seq_number {
            self.issued_seq_number = seq;
        }
        info!(
            node = %self.local_id(),
            slot = %number,
            request = ?request_digest,
            "slot committed"
        );

        let mut actions = vec![];
        if self.pending_requests.remove(&request_digest) {
            actions.push(Action::CancelTimer {
                id: TimerId::Request(request_digest),
            });
        }
        if seq > self.delivered {
            self.pending_delivery
                .insert(seq.0, (number, request_digest, request));
        }
        actions.extend(self.drain_deliveries());
        actions
    }

    /// Deliver committed operations in strictly ascending sequence order,
    /// stalling on gaps and while a snapshot fetch is outstanding.
    pub(crate) fn drain_deliveries(&mut self) -> Vec<Action> {
        let mut actions = vec![];
        if self.fetching_snapshot.is_some() {
            return actions;
        }
        while let Some((number, request_digest, request)) =
            self.pending_delivery.remove(&(self.delivered.0 + 1))
        {
            self.delivered = self.delivered.next();
            self.state_digest = self.state_digest.chain(&request_digest);
            if request.is_empty() {
                // Reconstructed no-op slot: commits, but nothing to apply.
                debug!(node = %self.local_id(), slot = %number, "no-op slot delivered");
            } else {
                actions.push(Action::DeliverCommitted { operation: request });
            }
            if self.config.checkpoint_interval > 0
                && self.delivered.0 % self.config.checkpoint_interval == 0
            {
                actions.extend(self.emit_checkpoint(number));
            }
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Checkpointing
    // ═══════════════════════════════════════════════════════════════════════

    fn emit_checkpoint(&mut self, number: SlotId) -> Vec<Action> {
        let checkpoint = Checkpoint {
            number,
            state_digest: self.state_digest,
            node: self.local_id(),
        };
        let signed = match Signed::sign(checkpoint, &self.keypair) {
            Ok(signed) => signed,
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "failed to sign checkpoint");
                return vec![];
            }
        };
        info!(
            node = %self.local_id(),
            checkpoint = %number,
            state = ?self.state_digest,
            "emitting checkpoint"
        );
        let mut actions = vec![Action::Broadcast {
            message: OutboundMessage::Checkpoint(signed.clone()),
        }];
        if let Some(stable) = self
            .checkpoints
            .record(self.local_id(), signed, &self.roster)
        {
            actions.extend(self.apply_stable(stable));
        }
        actions
    }

    pub fn on_checkpoint(&mut self, checkpoint: Signed<Checkpoint>) -> Vec<Action> {
        let signer = match checkpoint.verify(&self.roster) {
            Ok(signer) => signer,
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "invalid checkpoint signature");
                return vec![];
            }
        };
        if signer != checkpoint.payload.node {
            warn!(
                node = %self.local_id(),
                signer = %signer,
                claimed = %checkpoint.payload.node,
                "checkpoint signer does not match claimed sender"
            );
            return vec![];
        }
        if let Some(stable) = self.checkpoints.record(signer, checkpoint, &self.roster) {
            return self.apply_stable(stable);
        }
        vec![]
    }

    /// Truncate below a newly stable checkpoint and, if it outruns our own
    /// delivery pointer, begin a state-transfer fetch.
    fn apply_stable(&mut self, stable: StableCheckpoint) -> Vec<Action> {
        info!(
            node = %self.local_id(),
            checkpoint = %stable.number,
            "checkpoint stable, truncating log"
        );
        self.log.truncate_through(stable.number);

        let mut actions = vec![];
        if stable.number.seq_number > self.delivered && self.fetching_snapshot.is_none() {
            let witness = stable
                .proof
                .checkpoints
                .keys()
                .find(|node| **node != self.local_id())
                .copied();
            if let Some(witness) = witness {
                info!(
                    node = %self.local_id(),
                    delivered = %self.delivered,
                    checkpoint = %stable.number,
                    witness = %witness,
                    "lagging behind stable checkpoint, requesting snapshot"
                );
                let request = SnapshotRequest {
                    number: stable.number,
                    node: self.local_id(),
                };
                match Signed::sign(request, &self.keypair) {
                    Ok(signed) => {
                        self.fetching_snapshot = Some(stable.number);
                        actions.push(Action::SendTo {
                            node: witness,
                            message: OutboundMessage::SnapshotRequest(signed),
                        });
                    }
                    Err(e) => {
                        warn!(node = %self.local_id(), error = %e, "failed to sign snapshot request");
                    }
                }
            }
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // State transfer
    // ═══════════════════════════════════════════════════════════════════════

    pub fn on_snapshot_request(&mut self, request: Signed<SnapshotRequest>) -> Vec<Action> {
        let signer = match request.verify(&self.roster) {
            Ok(signer) => signer,
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "invalid snapshot request signature");
                return vec![];
            }
        };
        if signer != request.payload.node {
            warn!(node = %self.local_id(), signer = %signer, "snapshot request signer mismatch");
            return vec![];
        }
        let stable = self.checkpoints.stable();
        if stable.number.seq_number.0 == 0 {
            debug!(node = %self.local_id(), from = %signer, "no stable checkpoint to serve");
            return vec![];
        }
        let number = stable.number;
        debug!(node = %self.local_id(), from = %signer, checkpoint = %number, "snapshot requested");
        self.pending_snapshot_requests.push((signer, number));
        vec![Action::RequestSnapshot { number }]
    }

    pub fn on_collaborator_snapshot(&mut self, number: SlotId, snapshot: String) -> Vec<Action> {
        let stable = self.checkpoints.stable().clone();
        if number != stable.number {
            debug!(
                node = %self.local_id(),
                snapshot = %number,
                stable = %stable.number,
                "collaborator snapshot is stale"
            );
            self.pending_snapshot_requests
                .retain(|(_, wanted)| *wanted != number);
            return vec![];
        }

        let mut actions = vec![];
        let mut remaining = Vec::new();
        let drained: Vec<_> = self.pending_snapshot_requests.drain(..).collect();
        for (requester, wanted) in drained {
            if wanted != number {
                remaining.push((requester, wanted));
                continue;
            }
            let reply = SnapshotReply {
                number,
                state_digest: stable.state_digest,
                proof: stable.proof.clone(),
                snapshot: snapshot.clone(),
                node: self.roster.local_id(),
            };
            match Signed::sign(reply, &self.keypair) {
                Ok(signed) => {
                    debug!(node = %self.local_id(), to = %requester, "sending snapshot reply");
                    actions.push(Action::SendTo {
                        node: requester,
                        message: OutboundMessage::SnapshotReply(signed),
                    });
                }
                Err(e) => {
                    warn!(node = %self.local_id(), error = %e, "failed to sign snapshot reply");
                }
            }
        }
        self.pending_snapshot_requests = remaining;
        actions
    }

    pub fn on_snapshot_reply(&mut self, reply: Signed<SnapshotReply>) -> Vec<Action> {
        let signer = match reply.verify(&self.roster) {
            Ok(signer) => signer,
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "invalid snapshot reply signature");
                return vec![];
            }
        };
        let Some(target) = self.fetching_snapshot else {
            trace!(node = %self.local_id(), from = %signer, "unsolicited snapshot reply");
            return vec![];
        };
        let payload = reply.payload;
        if payload.number.seq_number < target.seq_number {
            debug!(
                node = %self.local_id(),
                offered = %payload.number,
                wanted = %target,
                "snapshot reply is older than the fetch target"
            );
            return vec![];
        }
        if !payload
            .proof
            .attests(&self.roster, payload.number, payload.state_digest)
        {
            warn!(
                node = %self.local_id(),
                from = %signer,
                checkpoint = %payload.number,
                "snapshot reply proof does not attest"
            );
            return vec![];
        }

        info!(
            node = %self.local_id(),
            checkpoint = %payload.number,
            "installing snapshot"
        );
        self.delivered = payload.number.seq_number;
        if payload.number.seq_number > self.sequence_number {
            self.sequence_number = payload.number.seq_number;
        }
        if payload.number.seq_number > self.issued_seq_number {
            self.issued_seq_number = payload.number.seq_number;
        }
        self.state_digest = payload.state_digest;
        self.checkpoints.install(StableCheckpoint {
            number: payload.number,
            state_digest: payload.state_digest,
            proof: payload.proof,
        });
        self.log.truncate_through(payload.number);
        let delivered = self.delivered.0;
        self.pending_delivery.retain(|seq, _| *seq > delivered);
        self.fetching_snapshot = None;

        let mut actions = vec![Action::InstallSnapshot {
            snapshot: payload.snapshot,
        }];
        actions.extend(self.drain_deliveries());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════

    /// Primary heartbeat tick.
    ///
    /// `caught_up` is the peer-progress map maintained by the runner from
    /// pre-prepare and heartbeat acks; peers trailing our delivery pointer
    /// get current-view pre-prepares re-sent from the log.
    pub fn on_heartbeat_timer(&mut self, caught_up: &HashMap<NodeId, SeqNumber>) -> Vec<Action> {
        if self.view_change.in_progress || !self.is_primary() {
            return vec![];
        }
        let mut actions = vec![Action::SetTimer {
            id: TimerId::Heartbeat,
            duration: self.config.heartbeat_interval,
        }];

        let mut heartbeat = keygrid_messages::NewView {
            view_number: self.view_number,
            view_changes: BTreeMap::new(),
            preprepares: Vec::new(),
            node: self.local_id(),
            digest: Digest::zero(),
        };
        if let Err(e) = heartbeat.seal() {
            warn!(node = %self.local_id(), error = %e, "failed to seal heartbeat");
            return actions;
        }
        match Signed::sign(heartbeat, &self.keypair) {
            Ok(signed) => {
                trace!(node = %self.local_id(), view = %self.view_number, "heartbeat");
                actions.push(Action::Broadcast {
                    message: OutboundMessage::NewView(signed),
                });
            }
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "failed to sign heartbeat");
            }
        }

        // Re-send current-view pre-prepares to lagging peers. Sorted for
        // deterministic action order.
        let mut lagging: Vec<(NodeId, SeqNumber)> = caught_up
            .iter()
            .filter(|(node, seq)| **node != self.local_id() && **seq < self.delivered)
            .map(|(node, seq)| (*node, *seq))
            .collect();
        lagging.sort();
        for (peer, acked) in lagging {
            let mut sent = 0usize;
            for (id, slot) in self.log.iter() {
                if sent >= self.config.catch_up_batch {
                    break;
                }
                if id.seq_number <= acked || id.view_number != self.view_number {
                    continue;
                }
                if let (Some(request), Some(preprepare)) = (&slot.request, &slot.preprepare) {
                    actions.push(Action::SendTo {
                        node: peer,
                        message: OutboundMessage::PrePrepare(PrePrepareEnvelope {
                            preprepare: preprepare.clone(),
                            request: request.clone(),
                        }),
                    });
                    sent += 1;
                }
            }
            if sent > 0 {
                debug!(
                    node = %self.local_id(),
                    peer = %peer,
                    acked = %acked,
                    resent = sent,
                    "re-sent pre-prepares to lagging peer"
                );
            }
        }
        actions
    }

    /// Backup suspicion of the primary expired.
    pub fn on_suspicion_timer(&mut self) -> Vec<Action> {
        if self.view_change.in_progress || self.is_primary() {
            return vec![];
        }
        warn!(
            node = %self.local_id(),
            view = %self.view_number,
            "primary silent for the suspicion interval, starting view change"
        );
        self.start_view_change(self.view_number.next())
    }

    /// A forwarded request was not committed within the request timeout.
    pub fn on_request_timer(&mut self, request_digest: Digest) -> Vec<Action> {
        if !self.pending_requests.remove(&request_digest) {
            return vec![];
        }
        warn!(
            node = %self.local_id(),
            request = ?request_digest,
            view = %self.view_number,
            "forwarded request did not commit in time, starting view change"
        );
        self.start_view_change(self.view_number.next())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Vote construction
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn make_prepare(
        &self,
        number: SlotId,
        request_digest: Digest,
    ) -> Result<Signed<Prepare>, CodecError> {
        let mut prepare = Prepare {
            number,
            request_digest,
            node: self.roster.local_id(),
            digest: Digest::zero(),
        };
        prepare.seal()?;
        Signed::sign(prepare, &self.keypair)
    }

    fn make_commit(
        &self,
        number: SlotId,
        request_digest: Digest,
    ) -> Result<Signed<Commit>, CodecError> {
        let mut commit = Commit {
            number,
            request_digest,
            node: self.roster.local_id(),
            digest: Digest::zero(),
        };
        commit.seal()?;
        Signed::sign(commit, &self.keypair)
    }
}

impl StateMachine for ReplicaState {
    /// Route an event to its handler.
    ///
    /// `HeartbeatTimer` routed through here carries no peer-progress
    /// information; the runner calls [`ReplicaState::on_heartbeat_timer`]
    /// directly with the live `caught_up` snapshot.
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::HeartbeatTimer => self.on_heartbeat_timer(&HashMap::new()),
            Event::SuspicionTimer => self.on_suspicion_timer(),
            Event::RequestTimer { request_digest } => self.on_request_timer(request_digest),
            Event::ViewChangeRetransmitTimer => self.on_view_change_retransmit_timer(),
            Event::ClientRequestReceived { request } => self.on_client_request_received(request),
            Event::PrePrepareReceived { envelope } => self.on_preprepare(envelope),
            Event::PrepareReceived { prepare } => self.on_prepare(prepare),
            Event::CommitReceived { commit } => self.on_commit(commit),
            Event::ViewChangeReceived { view_change } => self.on_view_change(view_change),
            Event::NewViewReceived { new_view } => self.on_new_view(new_view),
            Event::CheckpointReceived { checkpoint } => self.on_checkpoint(checkpoint),
            Event::SnapshotRequestReceived { request } => self.on_snapshot_request(request),
            Event::SnapshotReplyReceived { reply } => self.on_snapshot_reply(reply),
            Event::Propose { operation } => self.on_propose(operation),
            Event::CollaboratorSnapshot { number, snapshot } => {
                self.on_collaborator_snapshot(number, snapshot)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygrid_types::test_utils::{test_cluster, test_keypair};
    use tracing_test::traced_test;

    fn make_replica(id: u32) -> ReplicaState {
        let (config, keypairs) = test_cluster(4);
        let roster = config.view_for(NodeId(id)).unwrap();
        ReplicaState::new(
            roster,
            keypairs[id as usize].clone(),
            PbftConfig {
                checkpoint_interval: 4,
                ..Default::default()
            },
        )
    }

    fn find_broadcast<'a>(actions: &'a [Action], name: &str) -> Option<&'a OutboundMessage> {
        actions.iter().find_map(|action| match action {
            Action::Broadcast { message } if message.type_name() == name => Some(message),
            _ => None,
        })
    }

    #[traced_test]
    #[test]
    fn primary_assigns_sequential_slots() {
        let mut primary = make_replica(0);
        let first = primary.on_propose("op-1".into());
        let second = primary.on_propose("op-2".into());

        let pp1 = match find_broadcast(&first, "PrePrepare").unwrap() {
            OutboundMessage::PrePrepare(env) => env.preprepare.payload.clone(),
            _ => unreachable!(),
        };
        let pp2 = match find_broadcast(&second, "PrePrepare").unwrap() {
            OutboundMessage::PrePrepare(env) => env.preprepare.payload.clone(),
            _ => unreachable!(),
        };
        assert_eq!(pp1.number.seq_number, SeqNumber(1));
        assert_eq!(pp2.number.seq_number, SeqNumber(2));
        assert_eq!(pp1.number.view_number, ViewNumber(0));
    }

    #[traced_test]
    #[test]
    fn duplicate_proposal_is_deduped() {
        let mut primary = make_replica(0);
        assert!(!primary.on_propose("op".into()).is_empty());
        assert!(primary.on_propose("op".into()).is_empty());
    }

    #[traced_test]
    #[test]
    fn backup_forwards_to_primary_and_arms_timer() {
        let mut backup = make_replica(1);
        let actions = backup.on_propose("op".into());
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SendTo {
                node: NodeId(0),
                message: OutboundMessage::ClientRequest(_)
            }
        )));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer {
                id: TimerId::Request(_),
                ..
            }
        )));
    }

    #[traced_test]
    #[test]
    fn backup_accepts_preprepare_and_prepares() {
        let mut primary = make_replica(0);
        let mut backup = make_replica(1);
        let actions = primary.on_propose("op".into());
        let envelope = match find_broadcast(&actions, "PrePrepare").unwrap() {
            OutboundMessage::PrePrepare(env) => env.clone(),
            _ => unreachable!(),
        };

        let actions = backup.on_preprepare(envelope.clone());
        assert!(find_broadcast(&actions, "Prepare").is_some());
        // Valid primary traffic pushes the suspicion timer.
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer {
                id: TimerId::Suspicion,
                ..
            }
        )));

        // Duplicate pre-prepare with the same digest is a silent no-op.
        assert!(backup.on_preprepare(envelope).is_empty());
    }

    #[traced_test]
    #[test]
    fn conflicting_preprepare_digest_is_dropped() {
        let (_, keypairs) = test_cluster(4);
        let mut backup = make_replica(1);

        let number = SlotId::new(ViewNumber(0), SeqNumber(1));
        let make_envelope = |request: &str| {
            let mut header = PrePrepare {
                number,
                request_digest: Digest::of_bytes(request.as_bytes()),
                digest: Digest::zero(),
            };
            header.seal().unwrap();
            PrePrepareEnvelope {
                preprepare: Signed::sign(header, &keypairs[0]).unwrap(),
                request: request.to_string(),
            }
        };

        backup.on_preprepare(make_envelope("op-a"));
        backup.on_preprepare(make_envelope("op-b"));
        let slot = backup
            .log()
            .get(&number)
            .expect("slot exists after first pre-prepare");
        assert_eq!(
            slot.request_digest,
            Some(Digest::of_bytes(b"op-a")),
            "second digest must not displace the first"
        );
    }

    #[traced_test]
    #[test]
    fn preprepare_from_non_primary_is_dropped() {
        let mut backup = make_replica(1);
        let number = SlotId::new(ViewNumber(0), SeqNumber(1));
        let mut header = PrePrepare {
            number,
            request_digest: Digest::of_bytes(b"op"),
            digest: Digest::zero(),
        };
        header.seal().unwrap();
        // Signed by node 2, which does not lead view 0.
        let envelope = PrePrepareEnvelope {
            preprepare: Signed::sign(header, &test_keypair(2)).unwrap(),
            request: "op".into(),
        };
        assert!(backup.on_preprepare(envelope).is_empty());
        assert!(backup.log().get(&number).is_none());
    }

    #[traced_test]
    #[test]
    fn prepare_before_preprepare_is_buffered() {
        let mut backup = make_replica(1);
        let number = SlotId::new(ViewNumber(0), SeqNumber(1));
        let digest = Digest::of_bytes(b"op");

        let mut prepare = Prepare {
            number,
            request_digest: digest,
            node: NodeId(2),
            digest: Digest::zero(),
        };
        prepare.seal().unwrap();
        let signed = Signed::sign(prepare, &test_keypair(2)).unwrap();
        assert!(backup.on_prepare(signed).is_empty());

        let slot = backup.log().get(&number).expect("slot created on mention");
        assert_eq!(slot.prepares.len(), 1);
        assert!(!slot.prepared);
    }

    #[traced_test]
    #[test]
    fn out_of_window_preprepare_is_dropped() {
        let (_, keypairs) = test_cluster(4);
        let mut backup = make_replica(1);
        // Window is (0, 2 * interval] = (0, 8] for interval 4.
        let number = SlotId::new(ViewNumber(0), SeqNumber(9));
        let mut header = PrePrepare {
            number,
            request_digest: Digest::of_bytes(b"op"),
            digest: Digest::zero(),
        };
        header.seal().unwrap();
        let envelope = PrePrepareEnvelope {
            preprepare: Signed::sign(header, &keypairs[0]).unwrap(),
            request: "op".into(),
        };
        assert!(backup.on_preprepare(envelope).is_empty());
    }
}
