//! Action types for the replica state machine.

use crate::{message::OutboundMessage, TimerId};
use keygrid_types::{NodeId, SlotId};
use std::time::Duration;

/// Actions the state machine wants performed.
///
/// Actions are **commands**. The runner executes them and may convert their
/// results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Send a message to every peer in the roster.
    Broadcast { message: OutboundMessage },

    /// Send a message to one peer.
    SendTo {
        node: NodeId,
        message: OutboundMessage,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Arm (or re-arm) a timer.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a timer; a no-op if it is not armed.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Collaborator notifications
    // ═══════════════════════════════════════════════════════════════════════
    /// Hand a committed operation upward, in strict sequence order.
    DeliverCommitted { operation: String },

    /// Ask the collaborator for a snapshot of its state as of `number`.
    ///
    /// Answered with [`crate::Event::CollaboratorSnapshot`].
    RequestSnapshot { number: SlotId },

    /// Hand a fetched state snapshot to the collaborator to apply.
    InstallSnapshot { snapshot: String },
}

impl Action {
    /// The action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::SendTo { .. } => "SendTo",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::DeliverCommitted { .. } => "DeliverCommitted",
            Action::RequestSnapshot { .. } => "RequestSnapshot",
            Action::InstallSnapshot { .. } => "InstallSnapshot",
        }
    }

    /// Whether this action performs network I/O.
    pub fn is_network(&self) -> bool {
        matches!(self, Action::Broadcast { .. } | Action::SendTo { .. })
    }
}
