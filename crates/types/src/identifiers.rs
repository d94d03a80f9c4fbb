//! Protocol identifiers.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identifier of a replica within the roster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// An epoch of leadership; the primary for view `v` is `v mod N`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ViewNumber(pub u64);

impl ViewNumber {
    /// The next view.
    pub fn next(&self) -> ViewNumber {
        ViewNumber(self.0 + 1)
    }
}

impl fmt::Display for ViewNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Position in the totally ordered log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct SeqNumber(pub u64);

impl SeqNumber {
    /// The next sequence number.
    pub fn next(&self) -> SeqNumber {
        SeqNumber(self.0 + 1)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// An ordered position `(view, seq)` in the replicated log.
///
/// Ordered first by sequence number, then by view number: checkpoint
/// before/after comparisons and catch-up decisions care about log position,
/// not about which leadership epoch assigned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct SlotId {
    pub view_number: ViewNumber,
    pub seq_number: SeqNumber,
}

impl SlotId {
    /// Construct a slot identifier.
    pub fn new(view: ViewNumber, seq: SeqNumber) -> Self {
        Self {
            view_number: view,
            seq_number: seq,
        }
    }

    /// Whether this slot sits strictly before `other` in the log.
    pub fn before(&self, other: &SlotId) -> bool {
        self < other
    }
}

impl Ord for SlotId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq_number
            .cmp(&other.seq_number)
            .then(self.view_number.cmp(&other.view_number))
    }
}

impl PartialOrd for SlotId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.view_number, self.seq_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(view: u64, seq: u64) -> SlotId {
        SlotId::new(ViewNumber(view), SeqNumber(seq))
    }

    #[test]
    fn slots_order_by_seq_then_view() {
        assert!(slot(5, 1) < slot(0, 2));
        assert!(slot(0, 3) < slot(1, 3));
        assert_eq!(slot(2, 2), slot(2, 2));
    }

    #[test]
    fn before_is_strict() {
        assert!(slot(0, 1).before(&slot(0, 2)));
        assert!(!slot(0, 2).before(&slot(0, 2)));
    }
}
