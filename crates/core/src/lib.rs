//! Core event/action vocabulary for the keygrid replica.
//!
//! The replica is built on a simple event-driven model:
//!
//! ```text
//! Events → ReplicaState::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: no async, no `.await`
//! - **Deterministic**: same state + event = same actions
//! - **Pure-ish**: mutates itself, but performs no I/O
//!
//! All I/O lives in the runner, which delivers events, executes the returned
//! actions, and feeds action results back as new events.

mod action;
mod event;
mod message;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use message::OutboundMessage;

use keygrid_types::Digest;

/// Identifies a timer owned by the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Primary heartbeat tick.
    Heartbeat,
    /// Backup suspicion of the primary.
    Suspicion,
    /// Per-request commit wait at a backup, keyed by request digest.
    Request(Digest),
    /// View-change rebroadcast with exponential backoff.
    ViewChangeRetransmit,
}

/// A synchronous, deterministic state machine.
pub trait StateMachine {
    /// Process one event and return the actions it implies.
    fn handle(&mut self, event: Event) -> Vec<Action>;
}
