//! Event types for the replica state machine.

use keygrid_messages::{
    Checkpoint, ClientRequest, Commit, NewView, PrePrepareEnvelope, Prepare, Signed,
    SnapshotReply, SnapshotRequest, ViewChange,
};
use keygrid_types::{Digest, SlotId};

/// Priority levels for event ordering at the same instant.
///
/// Lower values are processed first: consequences of prior processing come
/// before fresh external input, preserving causality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Consequences of prior event processing.
    Internal = 0,
    /// Timers scheduled by the replica itself.
    Timer = 1,
    /// Inputs from other replicas.
    Network = 2,
    /// Inputs from clients.
    Client = 3,
}

/// All possible inputs to the replica state machine.
///
/// Events are **passive data** - they describe something that happened. The
/// state machine processes them and returns [`crate::Action`]s.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// The primary's heartbeat tick fired.
    HeartbeatTimer,

    /// A backup's suspicion of the primary expired.
    SuspicionTimer,

    /// A forwarded client request was not committed in time.
    RequestTimer { request_digest: Digest },

    /// Time to rebroadcast an in-progress view change.
    ViewChangeRetransmitTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // Network messages (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A client request, forwarded by a backup or accepted directly.
    ClientRequestReceived { request: Signed<ClientRequest> },

    /// A pre-prepare with its attached request.
    PrePrepareReceived { envelope: PrePrepareEnvelope },

    /// A prepare vote.
    PrepareReceived { prepare: Signed<Prepare> },

    /// A commit vote.
    CommitReceived { commit: Signed<Commit> },

    /// A view-change vote.
    ViewChangeReceived { view_change: Signed<ViewChange> },

    /// A new-view announcement (or primary heartbeat).
    NewViewReceived { new_view: Signed<NewView> },

    /// A checkpoint attestation.
    CheckpointReceived { checkpoint: Signed<Checkpoint> },

    /// A peer asks for a state snapshot.
    SnapshotRequestReceived { request: Signed<SnapshotRequest> },

    /// A peer delivered a state snapshot with its proof.
    SnapshotReplyReceived { reply: Signed<SnapshotReply> },

    // ═══════════════════════════════════════════════════════════════════════
    // Client requests (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// The local collaborator submitted an operation for ordering.
    Propose { operation: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Collaborator callbacks (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// The collaborator produced the snapshot a peer asked for.
    CollaboratorSnapshot { number: SlotId, snapshot: String },
}

impl Event {
    /// The ordering priority of this event.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::CollaboratorSnapshot { .. } => EventPriority::Internal,

            Event::HeartbeatTimer
            | Event::SuspicionTimer
            | Event::RequestTimer { .. }
            | Event::ViewChangeRetransmitTimer => EventPriority::Timer,

            Event::ClientRequestReceived { .. }
            | Event::PrePrepareReceived { .. }
            | Event::PrepareReceived { .. }
            | Event::CommitReceived { .. }
            | Event::ViewChangeReceived { .. }
            | Event::NewViewReceived { .. }
            | Event::CheckpointReceived { .. }
            | Event::SnapshotRequestReceived { .. }
            | Event::SnapshotReplyReceived { .. } => EventPriority::Network,

            Event::Propose { .. } => EventPriority::Client,
        }
    }

    /// The event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::HeartbeatTimer => "HeartbeatTimer",
            Event::SuspicionTimer => "SuspicionTimer",
            Event::RequestTimer { .. } => "RequestTimer",
            Event::ViewChangeRetransmitTimer => "ViewChangeRetransmitTimer",
            Event::ClientRequestReceived { .. } => "ClientRequestReceived",
            Event::PrePrepareReceived { .. } => "PrePrepareReceived",
            Event::PrepareReceived { .. } => "PrepareReceived",
            Event::CommitReceived { .. } => "CommitReceived",
            Event::ViewChangeReceived { .. } => "ViewChangeReceived",
            Event::NewViewReceived { .. } => "NewViewReceived",
            Event::CheckpointReceived { .. } => "CheckpointReceived",
            Event::SnapshotRequestReceived { .. } => "SnapshotRequestReceived",
            Event::SnapshotReplyReceived { .. } => "SnapshotReplyReceived",
            Event::Propose { .. } => "Propose",
            Event::CollaboratorSnapshot { .. } => "CollaboratorSnapshot",
        }
    }
}
