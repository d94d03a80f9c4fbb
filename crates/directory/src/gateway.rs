//! The client HTTP gateway.
//!
//! - `GET /?name=A` - look up a binding (served locally, never ordered)
//! - `POST /?name=A`, body = key - create a binding
//! - `PUT /?name=A`, body = key - update a binding
//!
//! Mutations are validated against the local store, proposed for ordering,
//! and answered when the commit notification arrives; a commit that does
//! not arrive within the wait window is a 500.

use crate::app::PendingRequests;
use crate::keystore::Keystore;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use keygrid_messages::ClientReply;
use keygrid_node::{ReplicaProposer, ReplicaStatus};
use keygrid_types::{Digest, NodeId, Operation, Sealable, ViewNumber};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a mutation waits for its commit before failing the request.
const COMMIT_WAIT: Duration = Duration::from_secs(10);

/// Shared state for the gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub store: Arc<RwLock<Keystore>>,
    pub pending: PendingRequests,
    pub proposer: ReplicaProposer,
    pub status: Arc<RwLock<ReplicaStatus>>,
}

#[derive(Debug, Deserialize)]
struct NameQuery {
    name: String,
}

async fn lookup_handler(
    State(state): State<GatewayState>,
    Query(query): Query<NameQuery>,
) -> Response {
    match state.store.read().await.lookup(&query.name) {
        Some(key) => Json(key.to_string()).into_response(),
        None => (StatusCode::NOT_FOUND, "Key not found").into_response(),
    }
}

async fn create_handler(
    State(state): State<GatewayState>,
    Query(query): Query<NameQuery>,
    body: String,
) -> Response {
    if state.store.read().await.lookup(&query.name).is_some() {
        return (StatusCode::BAD_REQUEST, "Key already exists for alias").into_response();
    }
    let operation = Operation::Create {
        alias: query.name,
        key: body,
    };
    submit_mutation(state, operation).await
}

async fn update_handler(
    State(state): State<GatewayState>,
    Query(query): Query<NameQuery>,
    body: String,
) -> Response {
    if state.store.read().await.lookup(&query.name).is_none() {
        return (StatusCode::BAD_REQUEST, "No key exists for alias").into_response();
    }
    let operation = Operation::Update {
        alias: query.name,
        key: body,
    };
    submit_mutation(state, operation).await
}

/// Propose a validated mutation and wait for its commit.
async fn submit_mutation(state: GatewayState, operation: Operation) -> Response {
    let encoded = match operation.encode().map(String::from_utf8) {
        Ok(Ok(encoded)) => encoded,
        _ => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error encoding operation")
                .into_response();
        }
    };
    let digest = Digest::of_bytes(encoded.as_bytes());
    let waiter = state.pending.register(digest);
    debug!(request = ?digest, alias = operation.alias(), "proposing mutation");

    if state.proposer.propose(encoded).await.is_err() {
        state.pending.forget(&digest);
        return (StatusCode::INTERNAL_SERVER_ERROR, "Replica unavailable").into_response();
    }

    let outcome = tokio::time::timeout(COMMIT_WAIT, waiter).await;
    state.pending.forget(&digest);
    match outcome {
        Ok(Ok(Ok(()))) => {
            let status = state.status.read().await.clone();
            commit_reply(&status, digest).into_response()
        }
        Ok(Ok(Err(reason))) => (StatusCode::INTERNAL_SERVER_ERROR, reason).into_response(),
        Ok(Err(_)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Commit wait abandoned").into_response()
        }
        Err(_) => {
            warn!(request = ?digest, "timeout on wait for commit");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Timeout on wait for commit",
            )
                .into_response()
        }
    }
}

/// The sealed reply body returned for a committed mutation.
fn commit_reply(status: &ReplicaStatus, request_digest: Digest) -> Json<ClientReply> {
    let mut reply = ClientReply {
        view_number: ViewNumber(status.view_number),
        request_digest,
        node: NodeId(status.node),
        result: String::new(),
        digest: Digest::zero(),
    };
    if let Err(e) = reply.seal() {
        warn!(error = %e, "failed to seal client reply");
    }
    Json(reply)
}

/// Build the gateway router.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route(
            "/",
            get(lookup_handler).post(create_handler).put(update_handler),
        )
        .with_state(state)
}

/// Bind and serve the client gateway.
pub async fn serve(
    addr: SocketAddr,
    state: GatewayState,
) -> Result<JoinHandle<()>, std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "client gateway listening");
    let app = router(state);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "client gateway exited");
        }
    }))
}
