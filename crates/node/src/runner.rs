//! The replica event loop and its collaborator handle.

use crate::rpc::{self, Ingress, IngressReceivers, RpcClient};
use crate::status::ReplicaStatus;
use crate::timers::TimerManager;
use keygrid_core::{Action, Event, StateMachine};
use keygrid_pbft::{PbftConfig, ReplicaState};
use keygrid_types::{ClusterView, KeyPair, NodeId, SeqNumber, SlotId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock as TokioRwLock};
use tracing::{debug, error, info, warn};

/// Errors from the replica runtime.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to bind the RPC listener: {0}")]
    Bind(#[from] std::io::Error),
    #[error("rpc client construction failed: {0}")]
    Rpc(#[from] rpc::RpcError),
    #[error("local node is missing from the roster")]
    UnknownLocalNode,
    #[error("collaborator channel closed")]
    CollaboratorGone,
}

/// Handle for shutting down a running replica.
///
/// Dropping it signals the event loop to exit.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Cloneable submission side of a [`ReplicaHandle`].
#[derive(Clone)]
pub struct ReplicaProposer {
    propose_tx: mpsc::Sender<String>,
}

impl ReplicaProposer {
    /// Submit an opaque operation for ordering.
    pub async fn propose(&self, operation: String) -> Result<(), RunnerError> {
        self.propose_tx
            .send(operation)
            .await
            .map_err(|_| RunnerError::CollaboratorGone)
    }
}

/// The collaborator-facing surface of a running replica.
///
/// Mirrors the upward interface of the consensus core: submit operations,
/// consume the ordered commit stream, learn of terminal failures, and serve
/// the snapshot plumbing for state transfer.
pub struct ReplicaHandle {
    propose_tx: mpsc::Sender<String>,
    committed_rx: mpsc::Receiver<String>,
    failure_rx: mpsc::Receiver<RunnerError>,
    snapshot_requested_rx: mpsc::Receiver<SlotId>,
    snapshot_reply_tx: mpsc::Sender<(SlotId, String)>,
    snapshotted_rx: mpsc::Receiver<String>,
    status: Arc<TokioRwLock<ReplicaStatus>>,
}

impl ReplicaHandle {
    /// Submit an opaque operation for ordering.
    pub async fn propose(&self, operation: String) -> Result<(), RunnerError> {
        self.propose_tx
            .send(operation)
            .await
            .map_err(|_| RunnerError::CollaboratorGone)
    }

    /// A cloneable submission handle for the gateway.
    pub fn proposer(&self) -> ReplicaProposer {
        ReplicaProposer {
            propose_tx: self.propose_tx.clone(),
        }
    }

    /// The live debug snapshot maintained by the event loop.
    pub fn status_handle(&self) -> Arc<TokioRwLock<ReplicaStatus>> {
        self.status.clone()
    }

    /// Next committed operation, in strict sequence order.
    pub async fn next_committed(&mut self) -> Option<String> {
        self.committed_rx.recv().await
    }

    /// Next terminal failure.
    pub async fn next_failure(&mut self) -> Option<RunnerError> {
        self.failure_rx.recv().await
    }

    /// Next peer request for a state snapshot at the given slot.
    pub async fn next_snapshot_request(&mut self) -> Option<SlotId> {
        self.snapshot_requested_rx.recv().await
    }

    /// Answer a snapshot request with the collaborator's serialized state.
    pub async fn snapshot_reply(
        &self,
        number: SlotId,
        snapshot: String,
    ) -> Result<(), RunnerError> {
        self.snapshot_reply_tx
            .send((number, snapshot))
            .await
            .map_err(|_| RunnerError::CollaboratorGone)
    }

    /// Next inbound state-transfer payload to apply.
    pub async fn next_snapshot(&mut self) -> Option<String> {
        self.snapshotted_rx.recv().await
    }

    /// Decompose into independently pollable streams, for consumers that
    /// select over several of them at once.
    pub fn into_streams(self) -> ReplicaStreams {
        let proposer = self.proposer();
        ReplicaStreams {
            proposer,
            committed: self.committed_rx,
            failures: self.failure_rx,
            snapshot_requests: self.snapshot_requested_rx,
            snapshot_replies: self.snapshot_reply_tx,
            snapshots: self.snapshotted_rx,
            status: self.status,
        }
    }
}

/// The split form of a [`ReplicaHandle`].
pub struct ReplicaStreams {
    pub proposer: ReplicaProposer,
    pub committed: mpsc::Receiver<String>,
    pub failures: mpsc::Receiver<RunnerError>,
    pub snapshot_requests: mpsc::Receiver<SlotId>,
    pub snapshot_replies: mpsc::Sender<(SlotId, String)>,
    pub snapshots: mpsc::Receiver<String>,
    pub status: Arc<TokioRwLock<ReplicaStatus>>,
}

/// A running replica: RPC listener plus event loop.
pub struct Replica;

impl Replica {
    /// Start the replica runtime and return the collaborator handle.
    pub async fn start(
        roster: ClusterView,
        keypair: KeyPair,
        config: PbftConfig,
    ) -> Result<(ReplicaHandle, ShutdownHandle), RunnerError> {
        let local = roster
            .peer(roster.local_id())
            .ok_or(RunnerError::UnknownLocalNode)?
            .clone();

        let delivered_seq = Arc::new(AtomicU64::new(0));
        let status = Arc::new(TokioRwLock::new(ReplicaStatus::default()));
        let (ingress, ingress_rx) = Ingress::channels(delivered_seq.clone(), status.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], local.port));
        let server = rpc::serve(addr, roster.endpoint(), ingress).await?;

        let (timer_tx, timer_rx) = mpsc::channel(64);
        let timers = TimerManager::new(timer_tx);
        let rpc_client = Arc::new(RpcClient::new(&roster, &config)?);

        let (propose_tx, propose_rx) = mpsc::channel(10);
        let (committed_tx, committed_rx) = mpsc::channel(256);
        let (failure_tx, failure_rx) = mpsc::channel(4);
        let (snapshot_requested_tx, snapshot_requested_rx) = mpsc::channel(4);
        let (snapshot_reply_tx, snapshot_reply_rx) = mpsc::channel(4);
        let (snapshotted_tx, snapshotted_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let state = ReplicaState::new(roster.clone(), keypair, config);
        let event_loop = EventLoop {
            state,
            roster,
            ingress_rx,
            timer_rx,
            timers,
            rpc: rpc_client,
            caught_up: Arc::new(StdRwLock::new(HashMap::new())),
            delivered_seq,
            status: status.clone(),
            propose_rx,
            committed_tx,
            failure_tx,
            snapshot_requested_tx,
            snapshot_reply_rx,
            snapshotted_tx,
            shutdown_rx,
            server,
        };
        tokio::spawn(event_loop.run());

        Ok((
            ReplicaHandle {
                propose_tx,
                committed_rx,
                failure_rx,
                snapshot_requested_rx,
                snapshot_reply_tx,
                snapshotted_rx,
                status,
            },
            ShutdownHandle {
                tx: Some(shutdown_tx),
            },
        ))
    }
}

struct EventLoop {
    state: ReplicaState,
    roster: ClusterView,
    ingress_rx: IngressReceivers,
    timer_rx: mpsc::Receiver<Event>,
    timers: TimerManager,
    rpc: Arc<RpcClient>,
    /// Peer → last acked delivered seq; written by RPC-reply tasks, read
    /// when the heartbeat timer fires. Critical sections are single
    /// reads/writes.
    caught_up: Arc<StdRwLock<HashMap<NodeId, SeqNumber>>>,
    delivered_seq: Arc<AtomicU64>,
    status: Arc<TokioRwLock<ReplicaStatus>>,
    propose_rx: mpsc::Receiver<String>,
    committed_tx: mpsc::Sender<String>,
    failure_tx: mpsc::Sender<RunnerError>,
    snapshot_requested_tx: mpsc::Sender<SlotId>,
    snapshot_reply_rx: mpsc::Receiver<(SlotId, String)>,
    snapshotted_tx: mpsc::Sender<String>,
    shutdown_rx: oneshot::Receiver<()>,
    server: tokio::task::JoinHandle<()>,
}

impl EventLoop {
    async fn run(mut self) {
        let actions = self.state.initialize();
        self.execute(actions).await;
        self.refresh_status().await;

        loop {
            let event = tokio::select! {
                _ = &mut self.shutdown_rx => break,
                Some(event) = self.ingress_rx.client_request.recv() => event,
                Some(event) = self.ingress_rx.preprepare.recv() => event,
                Some(event) = self.ingress_rx.prepare.recv() => event,
                Some(event) = self.ingress_rx.commit.recv() => event,
                Some(event) = self.ingress_rx.view_change.recv() => event,
                Some(event) = self.ingress_rx.new_view.recv() => event,
                Some(event) = self.ingress_rx.checkpoint.recv() => event,
                Some(event) = self.ingress_rx.snapshot.recv() => event,
                Some(event) = self.timer_rx.recv() => event,
                Some(operation) = self.propose_rx.recv() => Event::Propose { operation },
                Some((number, snapshot)) = self.snapshot_reply_rx.recv() => {
                    Event::CollaboratorSnapshot { number, snapshot }
                }
                else => break,
            };

            let actions = match event {
                // The heartbeat handler takes the live peer-progress
                // snapshot; everything else routes through `handle`.
                Event::HeartbeatTimer => {
                    let caught_up = match self.caught_up.read() {
                        Ok(map) => map.clone(),
                        Err(poisoned) => poisoned.into_inner().clone(),
                    };
                    self.state.on_heartbeat_timer(&caught_up)
                }
                other => self.state.handle(other),
            };
            self.execute(actions).await;
            self.refresh_status().await;
        }

        info!(node = %self.state.local_id(), "replica event loop stopped");
        self.timers.cancel_all();
        self.server.abort();
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast { message } => {
                    for peer in self.roster.peers() {
                        self.dispatch_send(peer, message.clone());
                    }
                }
                Action::SendTo { node, message } => {
                    self.dispatch_send(node, message);
                }
                Action::SetTimer { id, duration } => {
                    self.timers.set_timer(id, duration);
                }
                Action::CancelTimer { id } => {
                    self.timers.cancel_timer(id);
                }
                Action::DeliverCommitted { operation } => {
                    if self.committed_tx.send(operation).await.is_err() {
                        error!(
                            node = %self.state.local_id(),
                            "collaborator dropped the committed stream"
                        );
                        let _ = self.failure_tx.send(RunnerError::CollaboratorGone).await;
                    }
                }
                Action::RequestSnapshot { number } => {
                    if self.snapshot_requested_tx.send(number).await.is_err() {
                        warn!(node = %self.state.local_id(), "snapshot request stream closed");
                    }
                }
                Action::InstallSnapshot { snapshot } => {
                    if self.snapshotted_tx.send(snapshot).await.is_err() {
                        warn!(node = %self.state.local_id(), "snapshot install stream closed");
                    }
                }
            }
        }
    }

    /// Fire-and-forget send from a worker task; acked sequence numbers feed
    /// the peer-progress map.
    fn dispatch_send(&self, node: NodeId, message: keygrid_core::OutboundMessage) {
        let rpc = self.rpc.clone();
        let caught_up = self.caught_up.clone();
        tokio::spawn(async move {
            match rpc.send(node, &message).await {
                Ok(Some(ack)) => {
                    let mut map = match caught_up.write() {
                        Ok(map) => map,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    map.insert(node, ack.seq_number);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(peer = %node, kind = message.type_name(), error = %e, "send gave up");
                }
            }
        });
    }

    async fn refresh_status(&self) {
        self.delivered_seq
            .store(self.state.delivered().0, Ordering::SeqCst);
        *self.status.write().await = ReplicaStatus::snapshot(&self.state);
    }
}
