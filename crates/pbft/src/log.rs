//! The replicated log: a per-slot accumulator of protocol evidence.

use keygrid_messages::{Commit, PrePrepare, Prepare, Signed};
use keygrid_types::{Digest, NodeId, SlotId};
use std::collections::BTreeMap;

/// The per-sequence accumulator.
///
/// A slot is created on first mention - a client request at the primary or a
/// pre-prepare, prepare, or commit at a backup - and lives until a stable
/// checkpoint garbage-collects everything at or below its sequence.
#[derive(Debug, Clone, Default)]
pub struct Slot {
    /// The operation bytes; absent until the pre-prepare arrives.
    pub request: Option<String>,
    /// SHA-256 of `request`.
    pub request_digest: Option<Digest>,
    /// The accepted pre-prepare header for this slot.
    pub preprepare: Option<Signed<PrePrepare>>,
    /// Prepare votes, self included.
    pub prepares: BTreeMap<NodeId, Signed<Prepare>>,
    /// Commit votes, self included.
    pub commits: BTreeMap<NodeId, Signed<Commit>>,
    /// Latched once the prepare quorum is reached; never cleared.
    pub prepared: bool,
    /// Latched once the commit quorum is reached; never cleared.
    pub committed: bool,
}

impl Slot {
    /// Whether the prepare quorum is satisfied: a pre-prepare plus at least
    /// `2f` prepares (self included).
    pub fn has_prepare_quorum(&self, quorum_2f: usize) -> bool {
        self.preprepare.is_some() && self.prepares.len() >= quorum_2f
    }

    /// Whether the commit quorum is satisfied: prepared plus at least
    /// `2f + 1` commits (self included).
    pub fn has_commit_quorum(&self, quorum_2f_plus_one: usize) -> bool {
        self.prepared && self.commits.len() >= quorum_2f_plus_one
    }
}

/// Mapping from [`SlotId`] to [`Slot`].
///
/// Mutated only on the replica runtime thread.
#[derive(Debug, Clone, Default)]
pub struct SlotStore {
    slots: BTreeMap<SlotId, Slot>,
}

impl SlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create-if-absent lookup.
    pub fn ensure(&mut self, id: SlotId) -> &mut Slot {
        self.slots.entry(id).or_default()
    }

    pub fn get(&self, id: &SlotId) -> Option<&Slot> {
        self.slots.get(id)
    }

    pub fn get_mut(&mut self, id: &SlotId) -> Option<&mut Slot> {
        self.slots.get_mut(id)
    }

    /// Remove every slot at or below the stable checkpoint.
    pub fn truncate_through(&mut self, checkpoint: SlotId) {
        self.slots.retain(|id, _| *id > checkpoint);
    }

    /// Slots in log order.
    pub fn iter(&self) -> impl Iterator<Item = (&SlotId, &Slot)> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The highest slot currently held.
    pub fn highest(&self) -> Option<SlotId> {
        self.slots.keys().next_back().copied()
    }
}
