//! keygrid replica node.
//!
//! Runs one PBFT replica of the replicated public-key directory: the
//! consensus runtime on the cluster RPC port and the client gateway on the
//! node's client port.
//!
//! # Usage
//!
//! ```bash
//! keygrid --config cluster.json --id 0 --key-file node0.key
//! ```
//!
//! The cluster configuration is the shared JSON roster; the key file holds
//! this node's hex-encoded Ed25519 signing seed.

use anyhow::{bail, Context, Result};
use clap::Parser;
use keygrid_directory::gateway::{self, GatewayState};
use keygrid_directory::{KeyNode, Keystore};
use keygrid_node::Replica;
use keygrid_pbft::PbftConfig;
use keygrid_types::{ClusterConfig, KeyPair, NodeId};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// keygrid replica node.
#[derive(Parser, Debug)]
#[command(name = "keygrid")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the cluster configuration (JSON)
    #[arg(short, long, default_value = "cluster.json")]
    config: PathBuf,

    /// This node's id in the roster
    #[arg(long)]
    id: u32,

    /// Path to this node's signing key (hex-encoded seed)
    #[arg(long)]
    key_file: PathBuf,

    /// Log level filter (overrides RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let cluster = ClusterConfig::load(&cli.config)
        .with_context(|| format!("loading cluster config from {}", cli.config.display()))?;
    let local_id = NodeId(cli.id);
    let roster = cluster
        .view_for(local_id)
        .context("building the roster view")?;

    let key_hex = fs::read_to_string(&cli.key_file)
        .with_context(|| format!("reading signing key from {}", cli.key_file.display()))?;
    let keypair = KeyPair::from_hex(&key_hex).context("parsing the signing key")?;
    let expected = roster
        .public_key(local_id)
        .context("roster entry for this node")?;
    if keypair.public_key() != *expected {
        bail!("signing key does not match the roster entry for node {local_id}");
    }

    let client_port = roster
        .peer(local_id)
        .map(|peer| peer.client_port)
        .context("roster entry for this node")?;

    info!(node = %local_id, n = roster.size(), "starting keygrid replica");
    let (handle, shutdown) = Replica::start(roster, keypair, PbftConfig::default())
        .await
        .context("starting the replica runtime")?;

    let key_node = KeyNode::spawn(handle, Keystore::new());
    let gateway_state = GatewayState {
        store: key_node.store.clone(),
        pending: key_node.pending.clone(),
        proposer: key_node.proposer.clone(),
        status: key_node.status.clone(),
    };
    let gateway = gateway::serve(SocketAddr::from(([0, 0, 0, 0], client_port)), gateway_state)
        .await
        .context("starting the client gateway")?;

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    shutdown.shutdown();
    gateway.abort();
    key_node.join().await;
    Ok(())
}
