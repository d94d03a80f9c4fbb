//! View-change and new-view protocol.
//!
//! # Trigger
//!
//! A backup starts a view change when its suspicion timer expires, when a
//! forwarded request misses its commit window, or when `f+1` replicas are
//! already voting for higher views (fast-forward).
//!
//! # New-view construction
//!
//! The primary of the target view collects `2f+1` view-changes (its own
//! included) and reconstitutes the uncommitted tail of the log from their
//! prepared proofs: for every sequence between the highest stable checkpoint
//! in the set and the highest prepared sequence, the proof with the highest
//! view wins; gaps become no-op pre-prepares carrying the empty request.
//! Backups re-derive the same set from the carried view-changes and reject a
//! new-view whose pre-prepares differ.
//!
//! # Retransmission
//!
//! The view-change vote is rebroadcast on a doubling-backoff timer until the
//! view changes; a single lost round therefore cannot stall the cluster.

use keygrid_core::{Action, OutboundMessage, TimerId};
use keygrid_messages::{
    NewView, PrePrepare, PrePrepareEnvelope, PreparedProof, Signed, ViewChange,
};
use keygrid_types::{CodecError, Digest, NodeId, Sealable, SeqNumber, SlotId, ViewNumber};
use std::collections::BTreeMap;
use tracing::{debug, info, trace, warn};

use crate::config::PbftConfig;
use crate::state::ReplicaState;

/// View-change bookkeeping inside [`ReplicaState`].
#[derive(Debug, Clone, Default)]
pub(crate) struct ViewChangeStatus {
    /// Whether a view change is underway; most protocol traffic is dropped
    /// while set.
    pub in_progress: bool,
    /// The view being moved to.
    pub target: ViewNumber,
    /// Most recent view-change per sender (self included once voting).
    pub messages: BTreeMap<NodeId, Signed<ViewChange>>,
    /// Our own current vote, kept for rebroadcast.
    pub own_message: Option<Signed<ViewChange>>,
    /// Doubling-backoff exponent for the retransmit timer.
    pub retransmit_exponent: u32,
}

/// Deterministically reconstruct the new-view pre-prepare set from `2f+1`
/// view-changes.
///
/// Returns `(slot, request, request_digest)` triples: `min-s` is the highest
/// stable checkpoint in the set, `max-s` the highest sequence in any
/// prepared proof; within `[min-s, max-s]` the proof with the highest view
/// supplies the request, and uncovered sequences become no-ops with the
/// empty request. Empty when no proof reaches past `min-s`.
///
/// Both the primary (to build) and the backups (to validate) evaluate this
/// function, so it must depend on nothing but its arguments.
pub fn new_view_skeleton(
    view: ViewNumber,
    view_changes: &BTreeMap<NodeId, Signed<ViewChange>>,
) -> Vec<(SlotId, String, Digest)> {
    let mut min_s = 0u64;
    let mut max_s = 0u64;
    let mut best: BTreeMap<u64, (ViewNumber, String, Digest)> = BTreeMap::new();

    for signed in view_changes.values() {
        let vc = &signed.payload;
        min_s = min_s.max(vc.checkpoint.seq_number.0);
        for proof in &vc.prepared_proofs {
            let seq = proof.number.seq_number.0;
            max_s = max_s.max(seq);
            let candidate = (
                proof.number.view_number,
                proof.request.clone(),
                proof.request_digest,
            );
            match best.get(&seq) {
                Some((held_view, _, _)) if *held_view >= candidate.0 => {}
                _ => {
                    best.insert(seq, candidate);
                }
            }
        }
    }

    if min_s >= max_s {
        return Vec::new();
    }
    (min_s..=max_s)
        .map(|seq| {
            let number = SlotId::new(view, SeqNumber(seq));
            match best.get(&seq) {
                Some((_, request, digest)) => (number, request.clone(), *digest),
                None => (number, String::new(), Digest::of_bytes(b"")),
            }
        })
        .collect()
}

impl ReplicaState {
    // ═══════════════════════════════════════════════════════════════════════
    // Starting and voting
    // ═══════════════════════════════════════════════════════════════════════

    /// Vote to move to view `target`.
    ///
    /// A no-op when a view change to `target` (or beyond) is already
    /// underway, or when `target` is not ahead of the current view.
    pub(crate) fn start_view_change(&mut self, target: ViewNumber) -> Vec<Action> {
        let superseded = if self.view_change.in_progress {
            target <= self.view_change.target
        } else {
            target <= self.view_number
        };
        if superseded {
            return vec![];
        }

        info!(
            node = %self.local_id(),
            from = %self.view_number,
            to = %target,
            "starting view change"
        );
        self.view_change.in_progress = true;
        self.view_change.target = target;
        self.view_change.retransmit_exponent = 0;

        let stable = self.stable_checkpoint().clone();
        let mut message = ViewChange {
            view_number: target,
            checkpoint: stable.number,
            checkpoint_proof: stable.proof,
            prepared_proofs: self.prepared_proofs_above_checkpoint(),
            node: self.local_id(),
            digest: Digest::zero(),
        };
        if let Err(e) = message.seal() {
            warn!(node = %self.local_id(), error = %e, "failed to seal view change");
            return vec![];
        }
        let signed = match Signed::sign(message, &self.keypair) {
            Ok(signed) => signed,
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "failed to sign view change");
                return vec![];
            }
        };
        self.view_change.messages.insert(self.local_id(), signed.clone());
        self.view_change.own_message = Some(signed.clone());

        let mut actions = vec![
            Action::CancelTimer {
                id: TimerId::Heartbeat,
            },
            Action::CancelTimer {
                id: TimerId::Suspicion,
            },
            Action::SetTimer {
                id: TimerId::ViewChangeRetransmit,
                duration: self.config.retransmit_delay(0),
            },
            Action::Broadcast {
                message: OutboundMessage::ViewChange(signed),
            },
        ];
        // Peer votes may already complete the quorum for a view we lead.
        actions.extend(self.try_build_quorum_new_view());
        actions
    }

    /// Evidence carried in our view-change: a [`PreparedProof`] per slot
    /// prepared but not committed above the stable checkpoint.
    fn prepared_proofs_above_checkpoint(&self) -> Vec<PreparedProof> {
        let floor = self.stable_checkpoint().number;
        self.log
            .iter()
            .filter_map(|(id, slot)| {
                if *id <= floor || !slot.prepared || slot.committed {
                    return None;
                }
                let request = slot.request.as_ref()?;
                let request_digest = slot.request_digest?;
                let preprepare = slot.preprepare.as_ref()?;
                Some(PreparedProof {
                    number: *id,
                    request: request.clone(),
                    request_digest,
                    preprepare: preprepare.clone(),
                    prepares: slot.prepares.clone(),
                })
            })
            .collect()
    }

    /// Rebroadcast our vote until the view changes, with doubling backoff.
    pub fn on_view_change_retransmit_timer(&mut self) -> Vec<Action> {
        if !self.view_change.in_progress {
            return vec![];
        }
        let Some(own) = self.view_change.own_message.clone() else {
            return vec![];
        };
        let exponent = (self.view_change.retransmit_exponent + 1)
            .min(PbftConfig::MAX_BACKOFF_EXPONENT);
        self.view_change.retransmit_exponent = exponent;
        debug!(
            node = %self.local_id(),
            target = %self.view_change.target,
            exponent,
            "retransmitting view change"
        );
        vec![
            Action::Broadcast {
                message: OutboundMessage::ViewChange(own),
            },
            Action::SetTimer {
                id: TimerId::ViewChangeRetransmit,
                duration: self.config.retransmit_delay(exponent),
            },
        ]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Receiving view-changes
    // ═══════════════════════════════════════════════════════════════════════

    pub fn on_view_change(&mut self, view_change: Signed<ViewChange>) -> Vec<Action> {
        let signer = match view_change.verify(&self.roster) {
            Ok(signer) => signer,
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "invalid view change signature");
                return vec![];
            }
        };
        let vc = &view_change.payload;
        if vc.node != signer {
            warn!(
                node = %self.local_id(),
                signer = %signer,
                claimed = %vc.node,
                "view change signer does not match claimed sender"
            );
            return vec![];
        }
        match vc.seal_valid() {
            Ok(true) => {}
            Ok(false) => {
                warn!(node = %self.local_id(), from = %signer, "view change self-digest invalid");
                return vec![];
            }
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "view change digest check failed");
                return vec![];
            }
        }

        // Content validation: the carried checkpoint must be genesis or
        // quorum-attested, and every prepared proof well formed above it.
        if vc.checkpoint.seq_number.0 > 0
            && vc
                .checkpoint_proof
                .attested_digest(&self.roster, vc.checkpoint)
                .is_none()
        {
            warn!(
                node = %self.local_id(),
                from = %signer,
                checkpoint = %vc.checkpoint,
                "view change checkpoint proof does not attest"
            );
            return vec![];
        }
        for proof in &vc.prepared_proofs {
            if proof.number <= vc.checkpoint || !proof.is_well_formed(&self.roster) {
                warn!(
                    node = %self.local_id(),
                    from = %signer,
                    slot = %proof.number,
                    "view change carries a malformed prepared proof"
                );
                return vec![];
            }
        }

        trace!(
            node = %self.local_id(),
            from = %signer,
            target = %vc.view_number,
            proofs = vc.prepared_proofs.len(),
            "view change recorded"
        );
        let message_view = vc.view_number;
        self.view_change.messages.insert(signer, view_change);

        let mut actions = vec![];

        // Fast-forward: f+1 votes for views above ours move us even if our
        // own timer has not expired - to the smallest such view.
        let current = if self.view_change.in_progress {
            self.view_change.target
        } else {
            self.view_number
        };
        if message_view > current {
            let higher: Vec<ViewNumber> = self
                .view_change
                .messages
                .values()
                .map(|m| m.payload.view_number)
                .filter(|v| *v > current)
                .collect();
            if higher.len() >= self.roster.max_faulty() + 1 {
                let lowest = higher
                    .iter()
                    .copied()
                    .min()
                    .unwrap_or(message_view);
                debug!(
                    node = %self.local_id(),
                    lowest = %lowest,
                    votes = higher.len(),
                    "fast-forwarding view change"
                );
                actions.extend(self.start_view_change(lowest));
            }
        }

        actions.extend(self.try_build_quorum_new_view());
        actions
    }

    /// If we lead the in-progress target view and hold `2f+1` view-changes
    /// for it (self included), construct and broadcast the new-view.
    fn try_build_quorum_new_view(&mut self) -> Vec<Action> {
        if !self.view_change.in_progress {
            return vec![];
        }
        let target = self.view_change.target;
        if !self.roster.is_local_leader(target) {
            return vec![];
        }
        let votes = self
            .view_change
            .messages
            .values()
            .filter(|m| m.payload.view_number == target)
            .count();
        if votes < self.roster.quorum_2f_plus_one() {
            return vec![];
        }
        match self.build_new_view(target) {
            Ok(actions) => actions,
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "failed to build new view");
                vec![]
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // New-view construction (primary of the target view)
    // ═══════════════════════════════════════════════════════════════════════

    fn build_new_view(&mut self, target: ViewNumber) -> Result<Vec<Action>, CodecError> {
        let set: BTreeMap<NodeId, Signed<ViewChange>> = self
            .view_change
            .messages
            .iter()
            .filter(|(_, m)| m.payload.view_number == target)
            .map(|(node, m)| (*node, m.clone()))
            .collect();

        let skeleton = new_view_skeleton(target, &set);
        let mut envelopes = Vec::with_capacity(skeleton.len());
        let local = self.local_id();
        for (number, request, request_digest) in skeleton {
            let mut header = PrePrepare {
                number,
                request_digest,
                digest: Digest::zero(),
            };
            header.seal()?;
            let preprepare = Signed::sign(header, &self.keypair)?;
            let self_prepare = self.make_prepare(number, request_digest)?;

            if number.seq_number > self.issued_seq_number {
                self.issued_seq_number = number.seq_number;
            }
            self.known_digests.insert(request_digest);
            let slot = self.log.ensure(number);
            slot.request = Some(request.clone());
            slot.request_digest = Some(request_digest);
            slot.preprepare = Some(preprepare.clone());
            slot.prepares.insert(local, self_prepare);

            envelopes.push(PrePrepareEnvelope {
                preprepare,
                request,
            });
        }

        info!(
            node = %local,
            view = %target,
            view_changes = set.len(),
            reconstructed = envelopes.len(),
            "constructed new view"
        );
        let mut announcement = NewView {
            view_number: target,
            view_changes: set,
            preprepares: envelopes,
            node: local,
            digest: Digest::zero(),
        };
        announcement.seal()?;
        let signed = Signed::sign(announcement, &self.keypair)?;

        let mut actions = self.enter_new_view(target);
        actions.push(Action::Broadcast {
            message: OutboundMessage::NewView(signed),
        });
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Backup acceptance
    // ═══════════════════════════════════════════════════════════════════════

    pub fn on_new_view(&mut self, new_view: Signed<NewView>) -> Vec<Action> {
        let signer = match new_view.verify(&self.roster) {
            Ok(signer) => signer,
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "invalid new view signature");
                return vec![];
            }
        };
        let nv = &new_view.payload;
        if nv.node != signer {
            warn!(
                node = %self.local_id(),
                signer = %signer,
                claimed = %nv.node,
                "new view signer does not match claimed sender"
            );
            return vec![];
        }
        match nv.seal_valid() {
            Ok(true) => {}
            Ok(false) => {
                warn!(node = %self.local_id(), from = %signer, "new view self-digest invalid");
                return vec![];
            }
            Err(e) => {
                warn!(node = %self.local_id(), error = %e, "new view digest check failed");
                return vec![];
            }
        }
        if signer != self.roster.leader_for(nv.view_number) {
            warn!(
                node = %self.local_id(),
                signer = %signer,
                view = %nv.view_number,
                "new view not signed by the view's primary"
            );
            return vec![];
        }

        if nv.is_heartbeat() {
            // Periodic primary heartbeat for the current view.
            if !self.view_change.in_progress
                && nv.view_number == self.view_number
                && !self.is_primary()
            {
                trace!(node = %self.local_id(), view = %self.view_number, "heartbeat from primary");
                return vec![Action::SetTimer {
                    id: TimerId::Suspicion,
                    duration: self.suspicion_duration(),
                }];
            }
            trace!(node = %self.local_id(), view = %nv.view_number, "ignoring stale heartbeat");
            return vec![];
        }

        let acceptable = nv.view_number > self.view_number
            || (self.view_change.in_progress && nv.view_number == self.view_change.target);
        if !acceptable {
            debug!(
                node = %self.local_id(),
                offered = %nv.view_number,
                current = %self.view_number,
                "new view is not ahead of us"
            );
            return vec![];
        }

        // Every carried view-change must be validly signed by its claimed
        // sender for exactly this view.
        for (node, vc) in &nv.view_changes {
            let vc_signer = match vc.verify(&self.roster) {
                Ok(vc_signer) => vc_signer,
                Err(e) => {
                    warn!(node = %self.local_id(), error = %e, "new view carries an unverifiable view change");
                    return vec![];
                }
            };
            if vc_signer != *node || vc.payload.node != *node {
                warn!(node = %self.local_id(), "new view carries a misattributed view change");
                return vec![];
            }
            if vc.payload.view_number != nv.view_number {
                warn!(
                    node = %self.local_id(),
                    "new view carries a view change for a different view"
                );
                return vec![];
            }
            if !vc.payload.seal_valid().unwrap_or(false) {
                warn!(node = %self.local_id(), "new view carries a view change with a bad seal");
                return vec![];
            }
        }
        if nv.view_changes.len() < self.roster.quorum_2f_plus_one() {
            warn!(
                node = %self.local_id(),
                held = nv.view_changes.len(),
                needed = self.roster.quorum_2f_plus_one(),
                "new view carries fewer view changes than a quorum"
            );
            return vec![];
        }

        // O must be the deterministic function of V: re-derive and compare.
        let skeleton = new_view_skeleton(nv.view_number, &nv.view_changes);
        if skeleton.len() != nv.preprepares.len() {
            warn!(
                node = %self.local_id(),
                derived = skeleton.len(),
                carried = nv.preprepares.len(),
                "new view pre-prepares disagree with re-derivation"
            );
            return vec![];
        }
        for ((number, request, request_digest), envelope) in
            skeleton.iter().zip(nv.preprepares.iter())
        {
            let header = &envelope.preprepare.payload;
            if header.number != *number
                || header.request_digest != *request_digest
                || envelope.request != *request
            {
                warn!(
                    node = %self.local_id(),
                    slot = %number,
                    "new view pre-prepare differs from re-derivation"
                );
                return vec![];
            }
            if !matches!(envelope.preprepare.verify(&self.roster), Ok(s) if s == signer) {
                warn!(
                    node = %self.local_id(),
                    slot = %number,
                    "new view pre-prepare not signed by the new primary"
                );
                return vec![];
            }
        }

        info!(
            node = %self.local_id(),
            view = %nv.view_number,
            reconstructed = nv.preprepares.len(),
            "accepting new view"
        );
        let preprepares = new_view.payload.preprepares.clone();
        let mut actions = self.enter_new_view(new_view.payload.view_number);
        for envelope in preprepares {
            if envelope.preprepare.payload.number.seq_number > self.sequence_number {
                actions.extend(self.on_preprepare(envelope));
            }
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Entering a view
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn enter_new_view(&mut self, view: ViewNumber) -> Vec<Action> {
        info!(node = %self.local_id(), view = %view, "entering new view");
        self.view_change.in_progress = false;
        self.view_change.target = view;
        self.view_change.own_message = None;
        self.view_change.retransmit_exponent = 0;
        self.view_change
            .messages
            .retain(|_, m| m.payload.view_number > view);
        self.view_number = view;

        // The commit pointer floor: nothing at or below the stable
        // checkpoint (or the contiguous delivery point) is re-fed from a
        // new-view message.
        let floor = self
            .stable_checkpoint()
            .number
            .seq_number
            .max(self.delivered);
        self.sequence_number = floor;
        if self.issued_seq_number < floor {
            self.issued_seq_number = floor;
        }

        let mut actions = vec![Action::CancelTimer {
            id: TimerId::ViewChangeRetransmit,
        }];
        if self.is_primary() {
            actions.push(Action::CancelTimer {
                id: TimerId::Suspicion,
            });
            actions.push(Action::SetTimer {
                id: TimerId::Heartbeat,
                duration: self.config.heartbeat_interval,
            });
        } else {
            actions.push(Action::CancelTimer {
                id: TimerId::Heartbeat,
            });
            actions.push(Action::SetTimer {
                id: TimerId::Suspicion,
                duration: self.suspicion_duration(),
            });
        }
        actions
    }
}
