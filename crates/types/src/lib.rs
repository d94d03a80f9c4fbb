//! Foundation types for the keygrid replicated key directory.
//!
//! This crate provides the foundational types used throughout the
//! consensus implementation:
//!
//! - **Primitives**: SHA-256 digests, Ed25519 keys and detached signatures
//! - **Encoding**: deterministic canonical JSON, sealable self-digest payloads
//! - **Identifiers**: `NodeId`, `ViewNumber`, `SeqNumber`, `SlotId`
//! - **Cluster**: persisted configuration and the immutable roster view
//! - **Operations**: the tagged directory operation the consensus core
//!   carries as opaque bytes
//!
//! # Design Philosophy
//!
//! This crate is self-contained and does not depend on any other workspace
//! crate, making it the foundation layer.

mod canonical;
mod cluster;
mod crypto;
mod digest;
mod identifiers;
mod operation;
mod sealed;

pub use canonical::{to_canonical_bytes, CodecError};
pub use cluster::{ClusterConfig, ClusterView, ConfigError, NodeConfig, Peer};
pub use crypto::{CryptoError, Fingerprint, KeyPair, PublicKey, Signature};
pub use digest::{Digest, HexError, DIGEST_LEN};
pub use identifiers::{NodeId, SeqNumber, SlotId, ViewNumber};
pub use operation::Operation;
pub use sealed::Sealable;

/// Helpers for constructing deterministic fixtures in tests.
pub mod test_utils {
    use crate::{ClusterConfig, ClusterView, KeyPair, NodeConfig, NodeId};

    /// Deterministic keypair derived from a single-byte seed.
    pub fn test_keypair(seed: u8) -> KeyPair {
        KeyPair::from_seed(&[seed; 32])
    }

    /// A localhost cluster of `n` nodes with deterministic keys.
    ///
    /// Node `i` signs with `test_keypair(i)`.
    pub fn test_cluster(n: u32) -> (ClusterConfig, Vec<KeyPair>) {
        let keypairs: Vec<KeyPair> = (0..n).map(|i| test_keypair(i as u8)).collect();
        let nodes = keypairs
            .iter()
            .enumerate()
            .map(|(i, kp)| NodeConfig {
                id: NodeId(i as u32),
                host: "127.0.0.1".to_string(),
                port: 9000 + i as u16,
                client_port: 9500 + i as u16,
                key: kp.public_key().to_hex(),
            })
            .collect();
        let config = ClusterConfig {
            nodes,
            authority_key_file: "authority.key".into(),
            endpoint: "pbft".to_string(),
        };
        (config, keypairs)
    }

    /// The roster view of node `id` in a deterministic `n`-node cluster.
    pub fn test_view(n: u32, id: u32) -> ClusterView {
        let (config, _) = test_cluster(n);
        config
            .view_for(NodeId(id))
            .expect("test cluster config is well formed")
    }
}
