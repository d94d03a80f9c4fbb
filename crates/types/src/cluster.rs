//! Cluster configuration and the immutable roster view.
//!
//! The persisted JSON configuration names every replica, its endpoints, and
//! its public key. A [`ClusterView`] is the parsed, validated form a replica
//! keeps for its lifetime: leader rotation, quorum arithmetic, and signer
//! lookup never change after startup (dynamic membership is out of scope).

use crate::crypto::{Fingerprint, PublicKey};
use crate::identifiers::{NodeId, ViewNumber};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from loading or validating a cluster configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("cluster must have at least 4 nodes for f ≥ 1, got {0}")]
    TooSmall(usize),
    #[error("duplicate node id {0}")]
    DuplicateNode(NodeId),
    #[error("node {0} has an invalid public key: {1}")]
    BadKey(NodeId, String),
    #[error("node {0} is not in the cluster")]
    UnknownNode(NodeId),
}

/// One replica's entry in the persisted configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
    pub client_port: u16,
    /// Hex-encoded Ed25519 public key.
    pub key: String,
}

/// The persisted cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
    pub authority_key_file: PathBuf,
    pub endpoint: String,
}

impl ClusterConfig {
    /// Load and parse the configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Build the roster view for the replica `local_id`.
    pub fn view_for(&self, local_id: NodeId) -> Result<ClusterView, ConfigError> {
        ClusterView::new(self, local_id)
    }
}

/// One peer's resolved roster entry.
#[derive(Debug, Clone)]
pub struct Peer {
    pub host: String,
    pub port: u16,
    pub client_port: u16,
    pub public_key: PublicKey,
}

/// Immutable roster: identities, endpoints, leader rotation, and quorum
/// thresholds for a fixed cluster of `N = 3f + 1` replicas.
#[derive(Debug, Clone)]
pub struct ClusterView {
    local_id: NodeId,
    endpoint: String,
    nodes: BTreeMap<NodeId, Peer>,
    by_fingerprint: HashMap<Fingerprint, NodeId>,
    /// Roster ids in ascending order; `leader_for` indexes into this.
    ordered_ids: Vec<NodeId>,
    max_faulty: usize,
}

impl ClusterView {
    fn new(config: &ClusterConfig, local_id: NodeId) -> Result<Self, ConfigError> {
        if config.nodes.len() < 4 {
            return Err(ConfigError::TooSmall(config.nodes.len()));
        }

        let mut nodes = BTreeMap::new();
        let mut by_fingerprint = HashMap::new();
        for node in &config.nodes {
            let public_key = PublicKey::from_hex(&node.key)
                .map_err(|e| ConfigError::BadKey(node.id, e.to_string()))?;
            by_fingerprint.insert(public_key.fingerprint(), node.id);
            let replaced = nodes.insert(
                node.id,
                Peer {
                    host: node.host.clone(),
                    port: node.port,
                    client_port: node.client_port,
                    public_key,
                },
            );
            if replaced.is_some() {
                return Err(ConfigError::DuplicateNode(node.id));
            }
        }
        if !nodes.contains_key(&local_id) {
            return Err(ConfigError::UnknownNode(local_id));
        }

        let ordered_ids: Vec<NodeId> = nodes.keys().copied().collect();
        let max_faulty = (nodes.len() - 1) / 3;
        Ok(Self {
            local_id,
            endpoint: config.endpoint.clone(),
            nodes,
            by_fingerprint,
            ordered_ids,
            max_faulty,
        })
    }

    /// This replica's id.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// The RPC endpoint path shared by the cluster.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Total cluster size `N`.
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Maximum tolerated Byzantine replicas `f = ⌊(N−1)/3⌋`.
    pub fn max_faulty(&self) -> usize {
        self.max_faulty
    }

    /// The prepare threshold `2f`.
    pub fn quorum_2f(&self) -> usize {
        2 * self.max_faulty
    }

    /// The commit / stability threshold `2f + 1`.
    pub fn quorum_2f_plus_one(&self) -> usize {
        2 * self.max_faulty + 1
    }

    /// The primary for a view: `v mod N`, indexed into the ordered roster.
    pub fn leader_for(&self, view: ViewNumber) -> NodeId {
        self.ordered_ids[(view.0 % self.ordered_ids.len() as u64) as usize]
    }

    /// Whether this replica leads the given view.
    pub fn is_local_leader(&self, view: ViewNumber) -> bool {
        self.leader_for(view) == self.local_id
    }

    /// All roster ids, in ascending order.
    pub fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.ordered_ids.iter().copied()
    }

    /// Roster ids other than this replica.
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        let local = self.local_id;
        self.ordered_ids.iter().copied().filter(move |id| *id != local)
    }

    /// Whether `id` is in the roster.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// A peer's roster entry.
    pub fn peer(&self, id: NodeId) -> Option<&Peer> {
        self.nodes.get(&id)
    }

    /// A peer's verifying key.
    pub fn public_key(&self, id: NodeId) -> Option<&PublicKey> {
        self.nodes.get(&id).map(|p| &p.public_key)
    }

    /// Resolve a signer by key fingerprint.
    pub fn node_by_fingerprint(&self, fingerprint: &Fingerprint) -> Option<NodeId> {
        self.by_fingerprint.get(fingerprint).copied()
    }

    /// Base URL of a peer's replica RPC listener.
    pub fn rpc_url(&self, id: NodeId) -> Option<String> {
        self.nodes
            .get(&id)
            .map(|p| format!("http://{}:{}/{}", p.host, p.port, self.endpoint))
    }
}
