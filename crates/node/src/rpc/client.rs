//! Outbound RPC sender.
//!
//! Sends are short-fused (the configured RPC timeout, ~100 ms) and retried
//! a bounded number of times, then given up silently - the protocol
//! recovers via timeouts and view changes, not via reliable delivery.

use keygrid_core::OutboundMessage;
use keygrid_messages::SeqAck;
use keygrid_pbft::PbftConfig;
use keygrid_types::{ClusterView, NodeId};
use std::collections::HashMap;
use thiserror::Error;
use tracing::trace;

/// Errors from an outbound RPC.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("peer {0} is not in the roster")]
    UnknownPeer(NodeId),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("peer answered with status {0}")]
    Status(reqwest::StatusCode),
    #[error("message could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("retries exhausted")]
    Exhausted,
}

/// HTTP client over the roster's RPC endpoints.
pub struct RpcClient {
    http: reqwest::Client,
    endpoints: HashMap<NodeId, String>,
    retries: u32,
}

impl RpcClient {
    pub fn new(roster: &ClusterView, config: &PbftConfig) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(config.rpc_timeout)
            .build()?;
        let endpoints = roster
            .members()
            .filter_map(|id| roster.rpc_url(id).map(|url| (id, url)))
            .collect();
        Ok(Self {
            http,
            endpoints,
            retries: config.rpc_retries,
        })
    }

    /// POST a message to one peer, retrying up to the configured bound.
    ///
    /// Returns the peer's [`SeqAck`] for message kinds that carry one.
    pub async fn send(
        &self,
        node: NodeId,
        message: &OutboundMessage,
    ) -> Result<Option<SeqAck>, RpcError> {
        let base = self
            .endpoints
            .get(&node)
            .ok_or(RpcError::UnknownPeer(node))?;
        let url = format!("{base}/{}", message.route());
        let body = message_body(message)?;

        let mut last_error = RpcError::Exhausted;
        for attempt in 0..=self.retries {
            match self.http.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    if message.expects_seq_ack() {
                        let ack: SeqAck = response.json().await?;
                        return Ok(Some(ack));
                    }
                    return Ok(None);
                }
                Ok(response) => {
                    last_error = RpcError::Status(response.status());
                }
                Err(e) => {
                    last_error = RpcError::Http(e);
                }
            }
            trace!(attempt, %url, "rpc attempt failed");
        }
        Err(last_error)
    }
}

fn message_body(message: &OutboundMessage) -> Result<serde_json::Value, serde_json::Error> {
    match message {
        OutboundMessage::ClientRequest(m) => serde_json::to_value(m),
        OutboundMessage::PrePrepare(m) => serde_json::to_value(m),
        OutboundMessage::Prepare(m) => serde_json::to_value(m),
        OutboundMessage::Commit(m) => serde_json::to_value(m),
        OutboundMessage::ViewChange(m) => serde_json::to_value(m),
        OutboundMessage::NewView(m) => serde_json::to_value(m),
        OutboundMessage::Checkpoint(m) => serde_json::to_value(m),
        OutboundMessage::SnapshotRequest(m) => serde_json::to_value(m),
        OutboundMessage::SnapshotReply(m) => serde_json::to_value(m),
    }
}
