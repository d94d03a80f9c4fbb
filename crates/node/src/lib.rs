//! Replica runtime for keygrid.
//!
//! The runtime wraps the sans-IO [`keygrid_pbft::ReplicaState`] in a tokio
//! event loop:
//!
//! - RPC ingress enqueues onto one bounded channel per message kind and
//!   returns immediately; all protocol mutation happens on the loop task
//! - Timers are tokio sleep tasks funnelled into a unified timer channel
//! - Broadcasts run in spawned sender tasks with short timeouts and bounded
//!   retries, so the loop never blocks on network I/O
//!
//! The one piece of protocol-adjacent state shared outside the loop is the
//! `caught_up` peer-progress map, written by RPC-reply tasks and read when
//! the heartbeat timer fires.

mod runner;
mod status;
mod timers;

pub mod rpc;

pub use runner::{
    Replica, ReplicaHandle, ReplicaProposer, ReplicaStreams, RunnerError, ShutdownHandle,
};
pub use status::ReplicaStatus;
pub use timers::TimerManager;
