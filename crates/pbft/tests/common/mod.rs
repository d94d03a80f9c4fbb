//! Deterministic multi-replica test harness.
//!
//! Drives a set of sans-IO [`ReplicaState`]s through an in-memory FIFO
//! router: actions returned by one replica become events queued for the
//! others. No tokio, no clocks - timers are recorded and fired explicitly
//! by the test.

use keygrid_core::{Action, Event, OutboundMessage, StateMachine, TimerId};
use keygrid_pbft::{PbftConfig, ReplicaState};
use keygrid_types::test_utils::test_cluster;
use keygrid_types::NodeId;
use std::collections::{HashSet, VecDeque};

pub struct Cluster {
    pub nodes: Vec<ReplicaState>,
    /// Operations delivered upward, per node, in order.
    pub delivered: Vec<Vec<String>>,
    /// Snapshots installed at each node.
    pub installed_snapshots: Vec<Vec<String>>,
    /// Currently armed timers, per node.
    pub timers: Vec<HashSet<TimerId>>,
    queue: VecDeque<(usize, Event)>,
    down: HashSet<usize>,
    /// Blocked (from, to) links; messages across them are lost.
    blocked: HashSet<(usize, usize)>,
}

impl Cluster {
    pub fn new(n: u32) -> Self {
        Self::with_config(
            n,
            PbftConfig {
                checkpoint_interval: 64,
                ..Default::default()
            },
        )
    }

    pub fn with_config(n: u32, config: PbftConfig) -> Self {
        let (cluster_config, keypairs) = test_cluster(n);
        let nodes = (0..n)
            .map(|id| {
                let roster = cluster_config.view_for(NodeId(id)).unwrap();
                ReplicaState::new(roster, keypairs[id as usize].clone(), config.clone())
            })
            .collect::<Vec<_>>();
        let len = nodes.len();
        let mut cluster = Self {
            nodes,
            delivered: vec![Vec::new(); len],
            installed_snapshots: vec![Vec::new(); len],
            timers: vec![HashSet::new(); len],
            queue: VecDeque::new(),
            down: HashSet::new(),
            blocked: HashSet::new(),
        };
        for idx in 0..len {
            let actions = cluster.nodes[idx].initialize();
            cluster.absorb(idx, actions);
        }
        cluster
    }

    /// Mark a node crashed: it stops processing and emitting.
    pub fn crash(&mut self, node: usize) {
        self.down.insert(node);
    }

    /// Drop all messages sent from `from` to `to`.
    pub fn block_link(&mut self, from: usize, to: usize) {
        self.blocked.insert((from, to));
    }

    pub fn unblock_link(&mut self, from: usize, to: usize) {
        self.blocked.remove(&(from, to));
    }

    /// Submit an operation at a node and route until quiescent.
    pub fn propose(&mut self, node: usize, operation: &str) {
        self.fire(
            node,
            Event::Propose {
                operation: operation.to_string(),
            },
        );
    }

    /// Deliver one event to a node and route until quiescent.
    pub fn fire(&mut self, node: usize, event: Event) {
        self.queue.push_back((node, event));
        self.run();
    }

    /// Deliver one event to a node, queueing its consequences without
    /// routing them yet. Lets a test crash the node mid-protocol.
    pub fn inject(&mut self, node: usize, event: Event) {
        if self.down.contains(&node) {
            return;
        }
        let actions = self.nodes[node].handle(event);
        self.absorb(node, actions);
    }

    /// Route queued events until the cluster is quiescent.
    pub fn run(&mut self) {
        while let Some((dest, event)) = self.queue.pop_front() {
            if self.down.contains(&dest) {
                continue;
            }
            let actions = self.nodes[dest].handle(event);
            self.absorb(dest, actions);
        }
    }

    fn absorb(&mut self, from: usize, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast { message } => {
                    for dest in 0..self.nodes.len() {
                        if dest != from {
                            self.route(from, dest, message.clone());
                        }
                    }
                }
                Action::SendTo { node, message } => {
                    self.route(from, node.0 as usize, message);
                }
                Action::DeliverCommitted { operation } => {
                    self.delivered[from].push(operation);
                }
                Action::InstallSnapshot { snapshot } => {
                    self.installed_snapshots[from].push(snapshot);
                }
                Action::RequestSnapshot { number } => {
                    // Stand-in collaborator: answer instantly with a
                    // recognizable snapshot payload.
                    self.queue.push_back((
                        from,
                        Event::CollaboratorSnapshot {
                            number,
                            snapshot: format!("keystore-at-{}", number.seq_number.0),
                        },
                    ));
                }
                Action::SetTimer { id, .. } => {
                    self.timers[from].insert(id);
                }
                Action::CancelTimer { id } => {
                    self.timers[from].remove(&id);
                }
            }
        }
    }

    fn route(&mut self, from: usize, to: usize, message: OutboundMessage) {
        if self.down.contains(&to) || self.blocked.contains(&(from, to)) {
            return;
        }
        self.queue.push_back((to, event_for(message)));
    }
}

fn event_for(message: OutboundMessage) -> Event {
    match message {
        OutboundMessage::ClientRequest(request) => Event::ClientRequestReceived { request },
        OutboundMessage::PrePrepare(envelope) => Event::PrePrepareReceived { envelope },
        OutboundMessage::Prepare(prepare) => Event::PrepareReceived { prepare },
        OutboundMessage::Commit(commit) => Event::CommitReceived { commit },
        OutboundMessage::ViewChange(view_change) => Event::ViewChangeReceived { view_change },
        OutboundMessage::NewView(new_view) => Event::NewViewReceived { new_view },
        OutboundMessage::Checkpoint(checkpoint) => Event::CheckpointReceived { checkpoint },
        OutboundMessage::SnapshotRequest(request) => Event::SnapshotRequestReceived { request },
        OutboundMessage::SnapshotReply(reply) => Event::SnapshotReplyReceived { reply },
    }
}

/// The canonical encoding of a directory operation, as the gateway would
/// propose it.
pub fn op(kind: &str, alias: &str, key: &str) -> String {
    match kind {
        "create" => format!(r#"{{"alias":"{alias}","key":"{key}","op":"create"}}"#),
        "update" => format!(r#"{{"alias":"{alias}","key":"{key}","op":"update"}}"#),
        other => panic!("unknown operation kind {other}"),
    }
}
