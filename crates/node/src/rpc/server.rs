//! The replica-to-replica RPC listener.
//!
//! Every handler is non-blocking: it enqueues the decoded message onto the
//! channel for its kind and acknowledges. Protocol mutation happens only on
//! the event loop. Pre-prepare and new-view (heartbeat) replies carry the
//! replica's delivered sequence number so the primary can track peer
//! catch-up.

use crate::status::ReplicaStatus;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use keygrid_core::Event;
use keygrid_messages::{
    Ack, Checkpoint, ClientRequest, Commit, NewView, PrePrepareEnvelope, Prepare, SeqAck, Signed,
    SnapshotReply, SnapshotRequest, ViewChange,
};
use keygrid_types::SeqNumber;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Senders held by the RPC handlers, one bounded channel per message kind.
#[derive(Clone)]
pub struct Ingress {
    client_request: mpsc::Sender<Event>,
    preprepare: mpsc::Sender<Event>,
    prepare: mpsc::Sender<Event>,
    commit: mpsc::Sender<Event>,
    view_change: mpsc::Sender<Event>,
    new_view: mpsc::Sender<Event>,
    checkpoint: mpsc::Sender<Event>,
    snapshot: mpsc::Sender<Event>,
    /// Delivered sequence number, refreshed by the loop, read by acks.
    pub delivered_seq: Arc<AtomicU64>,
    /// Debug snapshot, refreshed by the loop.
    pub status: Arc<RwLock<ReplicaStatus>>,
}

/// Receiver ends owned by the event loop.
pub struct IngressReceivers {
    pub client_request: mpsc::Receiver<Event>,
    pub preprepare: mpsc::Receiver<Event>,
    pub prepare: mpsc::Receiver<Event>,
    pub commit: mpsc::Receiver<Event>,
    pub view_change: mpsc::Receiver<Event>,
    pub new_view: mpsc::Receiver<Event>,
    pub checkpoint: mpsc::Receiver<Event>,
    pub snapshot: mpsc::Receiver<Event>,
}

impl Ingress {
    /// Build the per-kind channel pairs.
    ///
    /// The client-request channel is kept small for inherent rate limiting;
    /// vote traffic gets more headroom.
    pub fn channels(
        delivered_seq: Arc<AtomicU64>,
        status: Arc<RwLock<ReplicaStatus>>,
    ) -> (Self, IngressReceivers) {
        let (client_request_tx, client_request_rx) = mpsc::channel(10);
        let (preprepare_tx, preprepare_rx) = mpsc::channel(128);
        let (prepare_tx, prepare_rx) = mpsc::channel(256);
        let (commit_tx, commit_rx) = mpsc::channel(256);
        let (view_change_tx, view_change_rx) = mpsc::channel(64);
        let (new_view_tx, new_view_rx) = mpsc::channel(64);
        let (checkpoint_tx, checkpoint_rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(16);
        (
            Self {
                client_request: client_request_tx,
                preprepare: preprepare_tx,
                prepare: prepare_tx,
                commit: commit_tx,
                view_change: view_change_tx,
                new_view: new_view_tx,
                checkpoint: checkpoint_tx,
                snapshot: snapshot_tx,
                delivered_seq,
                status,
            },
            IngressReceivers {
                client_request: client_request_rx,
                preprepare: preprepare_rx,
                prepare: prepare_rx,
                commit: commit_rx,
                view_change: view_change_rx,
                new_view: new_view_rx,
                checkpoint: checkpoint_rx,
                snapshot: snapshot_rx,
            },
        )
    }

    fn seq_ack(&self) -> SeqAck {
        SeqAck {
            seq_number: SeqNumber(self.delivered_seq.load(Ordering::SeqCst)),
        }
    }
}

/// Non-blocking enqueue; a full channel sheds load and the protocol
/// recovers via timeouts.
fn enqueue(tx: &mpsc::Sender<Event>, event: Event) {
    if let Err(e) = tx.try_send(event) {
        warn!(error = %e, "ingress channel full, dropping message");
    }
}

async fn client_request_handler(
    State(ingress): State<Ingress>,
    Json(request): Json<Signed<ClientRequest>>,
) -> Json<Ack> {
    enqueue(
        &ingress.client_request,
        Event::ClientRequestReceived { request },
    );
    Json(Ack::ok())
}

async fn preprepare_handler(
    State(ingress): State<Ingress>,
    Json(envelope): Json<PrePrepareEnvelope>,
) -> Json<SeqAck> {
    enqueue(&ingress.preprepare, Event::PrePrepareReceived { envelope });
    Json(ingress.seq_ack())
}

async fn prepare_handler(
    State(ingress): State<Ingress>,
    Json(prepare): Json<Signed<Prepare>>,
) -> Json<Ack> {
    enqueue(&ingress.prepare, Event::PrepareReceived { prepare });
    Json(Ack::ok())
}

async fn commit_handler(
    State(ingress): State<Ingress>,
    Json(commit): Json<Signed<Commit>>,
) -> Json<Ack> {
    enqueue(&ingress.commit, Event::CommitReceived { commit });
    Json(Ack::ok())
}

async fn view_change_handler(
    State(ingress): State<Ingress>,
    Json(view_change): Json<Signed<ViewChange>>,
) -> Json<Ack> {
    enqueue(&ingress.view_change, Event::ViewChangeReceived { view_change });
    Json(Ack::ok())
}

async fn new_view_handler(
    State(ingress): State<Ingress>,
    Json(new_view): Json<Signed<NewView>>,
) -> Json<SeqAck> {
    enqueue(&ingress.new_view, Event::NewViewReceived { new_view });
    Json(ingress.seq_ack())
}

async fn checkpoint_handler(
    State(ingress): State<Ingress>,
    Json(checkpoint): Json<Signed<Checkpoint>>,
) -> Json<Ack> {
    enqueue(&ingress.checkpoint, Event::CheckpointReceived { checkpoint });
    Json(Ack::ok())
}

async fn snapshot_request_handler(
    State(ingress): State<Ingress>,
    Json(request): Json<Signed<SnapshotRequest>>,
) -> Json<Ack> {
    enqueue(&ingress.snapshot, Event::SnapshotRequestReceived { request });
    Json(Ack::ok())
}

async fn snapshot_reply_handler(
    State(ingress): State<Ingress>,
    Json(reply): Json<Signed<SnapshotReply>>,
) -> Json<Ack> {
    enqueue(&ingress.snapshot, Event::SnapshotReplyReceived { reply });
    Json(Ack::ok())
}

async fn debug_handler(State(ingress): State<Ingress>) -> Json<ReplicaStatus> {
    Json(ingress.status.read().await.clone())
}

/// Build the replica RPC router for the cluster's endpoint path.
pub fn router(endpoint: &str, ingress: Ingress) -> Router {
    let protocol = Router::new()
        .route("/client-request", post(client_request_handler))
        .route("/preprepare", post(preprepare_handler))
        .route("/prepare", post(prepare_handler))
        .route("/commit", post(commit_handler))
        .route("/view-change", post(view_change_handler))
        .route("/new-view", post(new_view_handler))
        .route("/checkpoint", post(checkpoint_handler))
        .route("/snapshot-request", post(snapshot_request_handler))
        .route("/snapshot-reply", post(snapshot_reply_handler));
    Router::new()
        .nest(&format!("/{endpoint}"), protocol)
        .route(&format!("/debug/{endpoint}"), get(debug_handler))
        .with_state(ingress)
}

/// Bind and serve the replica RPC listener.
pub async fn serve(
    addr: SocketAddr,
    endpoint: &str,
    ingress: Ingress,
) -> Result<JoinHandle<()>, std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, endpoint, "replica RPC listening");
    let app = router(endpoint, ingress);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "replica RPC server exited");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygrid_types::test_utils::test_keypair;

    fn test_ingress() -> (Ingress, IngressReceivers) {
        Ingress::channels(
            Arc::new(AtomicU64::new(7)),
            Arc::new(RwLock::new(ReplicaStatus::default())),
        )
    }

    #[tokio::test]
    async fn handlers_enqueue_and_ack() {
        let (ingress, mut receivers) = test_ingress();
        let request = Signed::sign(
            ClientRequest {
                operation: "op".into(),
            },
            &test_keypair(1),
        )
        .unwrap();

        let Json(ack) =
            client_request_handler(State(ingress.clone()), Json(request)).await;
        assert!(ack.success);

        let event = receivers.client_request.recv().await.unwrap();
        assert!(matches!(event, Event::ClientRequestReceived { .. }));
    }

    #[tokio::test]
    async fn seq_ack_reports_delivered_sequence() {
        let (ingress, _receivers) = test_ingress();
        assert_eq!(ingress.seq_ack().seq_number, SeqNumber(7));
    }

    #[tokio::test]
    async fn full_channel_sheds_load() {
        let (ingress, _receivers) = test_ingress();
        // Capacity is 10 for client requests; the 11th is shed without
        // blocking the handler.
        for i in 0..=10 {
            let request = Signed::sign(
                ClientRequest {
                    operation: format!("op-{i}"),
                },
                &test_keypair(1),
            )
            .unwrap();
            let Json(ack) =
                client_request_handler(State(ingress.clone()), Json(request)).await;
            assert!(ack.success);
        }
    }
}
