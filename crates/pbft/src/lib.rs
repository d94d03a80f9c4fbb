//! PBFT replica state machine.
//!
//! This crate implements the Practical Byzantine Fault Tolerance replica as
//! a synchronous, event-driven model:
//!
//! - Timer events drive the primary heartbeat, backup suspicion, per-request
//!   commit waits, and view-change retransmission
//! - Network events carry validated, signed protocol messages through the
//!   three-phase pipeline (pre-prepare → prepare → commit)
//! - Quorum detection latches `prepared` (pre-prepare + 2f prepares, self
//!   included) and `committed` (prepared + 2f+1 commits, self included)
//! - Committed operations are delivered upward strictly in sequence order
//!
//! All I/O is performed by the runner via returned `Action`s.
//!
//! # Terminology
//!
//! - **View**: an epoch of leadership; the primary for view `v` is `v mod N`.
//! - **Slot**: an ordered position `(view, seq)` in the replicated log.
//! - **Stable checkpoint**: a checkpoint backed by `2f+1` matching signed
//!   attestations; the log below it is garbage-collected.
//! - **Prepared proof**: evidence carried in a view-change that a slot was
//!   prepared - its pre-prepare plus the collected prepares.
//!
//! # Safety
//!
//! - A slot accepts at most one pre-prepare digest per `(view, seq)`;
//!   a conflicting digest is logged and dropped.
//! - `prepared` and `committed` latch monotonically.
//! - Any two quorums of `2f+1` intersect in at least one correct replica, so
//!   conflicting requests cannot both commit at the same sequence number.
//!
//! # Liveness
//!
//! - Backups suspect the primary after `N` silent heartbeat intervals and
//!   vote to move to the next view.
//! - `f+1` view-change votes for higher views fast-forward a replica even if
//!   its own timer has not expired.
//! - View-change votes are rebroadcast with doubling backoff until the view
//!   changes, so a lost round cannot stall the cluster.

mod checkpoint;
mod config;
mod log;
mod state;
mod view_change;

pub use checkpoint::{CheckpointLedger, StableCheckpoint};
pub use config::PbftConfig;
pub use log::{Slot, SlotStore};
pub use state::ReplicaState;
pub use view_change::new_view_skeleton;
