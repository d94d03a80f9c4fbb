//! Wire messages for the keygrid consensus protocol.
//!
//! Every protocol message has two forms: an unsigned payload and a
//! [`Signed`] wrapper carrying a detached signature over the payload's
//! canonical JSON encoding. Payloads in the self-digest family implement
//! [`keygrid_types::Sealable`].

mod ack;
mod signed;
pub mod wire;

pub use ack::{Ack, SeqAck};
pub use signed::Signed;
pub use wire::checkpoint::{Checkpoint, CheckpointProof, SnapshotRequest, SnapshotReply};
pub use wire::client::{ClientReply, ClientRequest};
pub use wire::three_phase::{Commit, PrePrepare, PrePrepareEnvelope, Prepare};
pub use wire::view_change::{NewView, PreparedProof, ViewChange};
