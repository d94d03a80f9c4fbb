//! Replicated public-key directory over the keygrid PBFT core.
//!
//! The directory is the consensus core's state-machine collaborator:
//! committed `create`/`update` operations are applied to the
//! (alias → key) [`Keystore`] in commit order, lookups are served from the
//! local store, and snapshots of the store travel over the consensus
//! state-transfer channel.
//!
//! Clients speak HTTP to the [`gateway`]: `GET /?name=A` looks up,
//! `POST /?name=A` creates, `PUT /?name=A` updates; mutations block until
//! the operation commits or the wait times out.

mod app;
mod keystore;

pub mod gateway;

pub use app::{KeyNode, PendingRequests};
pub use keystore::{Keystore, StoreError};
