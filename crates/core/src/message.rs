//! Outbound message types for network communication.

use keygrid_messages::{
    Checkpoint, ClientRequest, Commit, NewView, PrePrepareEnvelope, Prepare, Signed,
    SnapshotReply, SnapshotRequest, ViewChange,
};

/// Outbound network messages.
///
/// One variant per RPC method; the runner performs the actual sends.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// A client request forwarded to the primary.
    ClientRequest(Signed<ClientRequest>),

    /// Ordering assignment for a slot.
    PrePrepare(PrePrepareEnvelope),

    /// Prepare vote.
    Prepare(Signed<Prepare>),

    /// Commit vote.
    Commit(Signed<Commit>),

    /// Vote to move to a higher view.
    ViewChange(Signed<ViewChange>),

    /// New-view announcement; doubles as the primary heartbeat.
    NewView(Signed<NewView>),

    /// Checkpoint attestation.
    Checkpoint(Signed<Checkpoint>),

    /// Request for a state snapshot.
    SnapshotRequest(Signed<SnapshotRequest>),

    /// State snapshot with proof.
    SnapshotReply(Signed<SnapshotReply>),
}

impl OutboundMessage {
    /// A human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::ClientRequest(_) => "ClientRequest",
            OutboundMessage::PrePrepare(_) => "PrePrepare",
            OutboundMessage::Prepare(_) => "Prepare",
            OutboundMessage::Commit(_) => "Commit",
            OutboundMessage::ViewChange(_) => "ViewChange",
            OutboundMessage::NewView(_) => "NewView",
            OutboundMessage::Checkpoint(_) => "Checkpoint",
            OutboundMessage::SnapshotRequest(_) => "SnapshotRequest",
            OutboundMessage::SnapshotReply(_) => "SnapshotReply",
        }
    }

    /// The RPC route suffix this message is POSTed to.
    pub fn route(&self) -> &'static str {
        match self {
            OutboundMessage::ClientRequest(_) => "client-request",
            OutboundMessage::PrePrepare(_) => "preprepare",
            OutboundMessage::Prepare(_) => "prepare",
            OutboundMessage::Commit(_) => "commit",
            OutboundMessage::ViewChange(_) => "view-change",
            OutboundMessage::NewView(_) => "new-view",
            OutboundMessage::Checkpoint(_) => "checkpoint",
            OutboundMessage::SnapshotRequest(_) => "snapshot-request",
            OutboundMessage::SnapshotReply(_) => "snapshot-reply",
        }
    }

    /// Whether replies to this message carry the peer's delivered sequence
    /// number (used for catch-up tracking).
    pub fn expects_seq_ack(&self) -> bool {
        matches!(
            self,
            OutboundMessage::PrePrepare(_) | OutboundMessage::NewView(_)
        )
    }
}
