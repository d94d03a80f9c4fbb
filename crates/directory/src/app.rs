//! The key node: glue between the consensus replica and the key store.

use crate::keystore::Keystore;
use keygrid_node::{ReplicaHandle, ReplicaProposer, ReplicaStatus, ReplicaStreams};
use keygrid_types::{Digest, Operation};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outcome reported to a waiting client request: `Ok` on applied commit,
/// `Err` with a short description otherwise.
pub type CommitOutcome = Result<(), String>;

/// Client requests awaiting their commit, keyed by operation digest.
///
/// Inserted by gateway handlers, resolved by the commit consumer; the two
/// run concurrently, hence the lock.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<Digest, oneshot::Sender<CommitOutcome>>>>,
}

impl PendingRequests {
    /// Register a waiter for an operation digest.
    pub fn register(&self, digest: Digest) -> oneshot::Receiver<CommitOutcome> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut map) = self.inner.lock() {
            map.insert(digest, tx);
        }
        rx
    }

    /// Drop a waiter (commit wait finished or timed out).
    pub fn forget(&self, digest: &Digest) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(digest);
        }
    }

    /// Resolve a waiter, if one is registered for this digest.
    fn notify(&self, digest: &Digest, outcome: CommitOutcome) {
        let waiter = match self.inner.lock() {
            Ok(mut map) => map.remove(digest),
            Err(_) => None,
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                debug!(request = ?digest, "no pending client request for committed operation");
            }
        }
    }
}

/// The running collaborator: applies the committed stream to the store,
/// answers snapshot requests, and installs transferred snapshots.
pub struct KeyNode {
    pub store: Arc<RwLock<Keystore>>,
    pub pending: PendingRequests,
    pub proposer: ReplicaProposer,
    pub status: Arc<RwLock<ReplicaStatus>>,
    task: JoinHandle<()>,
}

impl KeyNode {
    /// Spawn the collaborator over a running replica.
    pub fn spawn(handle: ReplicaHandle, initial: Keystore) -> Self {
        let streams = handle.into_streams();
        let store = Arc::new(RwLock::new(initial));
        let pending = PendingRequests::default();
        let proposer = streams.proposer.clone();
        let status = streams.status.clone();
        let task = tokio::spawn(run(streams, store.clone(), pending.clone()));
        Self {
            store,
            pending,
            proposer,
            status,
            task,
        }
    }

    /// Wait for the collaborator loop to stop (replica failure).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn run(mut streams: ReplicaStreams, store: Arc<RwLock<Keystore>>, pending: PendingRequests) {
    loop {
        tokio::select! {
            committed = streams.committed.recv() => {
                let Some(operation) = committed else { break };
                apply_committed(&store, &pending, operation).await;
            }
            requested = streams.snapshot_requests.recv() => {
                let Some(number) = requested else { break };
                let snapshot = store.read().await.snapshot();
                match snapshot {
                    Ok(snapshot) => {
                        debug!(slot = %number, "serving snapshot");
                        if streams.snapshot_replies.send((number, snapshot)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Log only; the protocol recovers without us.
                        error!(error = %e, "failed to snapshot the keystore");
                    }
                }
            }
            snapshot = streams.snapshots.recv() => {
                let Some(snapshot) = snapshot else { break };
                match store.write().await.install_snapshot(&snapshot) {
                    Ok(()) => info!("installed transferred keystore snapshot"),
                    Err(e) => error!(error = %e, "failed to install snapshot"),
                }
            }
            failure = streams.failures.recv() => {
                match failure {
                    Some(e) => error!(error = %e, "replica reported a terminal failure"),
                    None => debug!("replica failure stream closed"),
                }
                break;
            }
        }
    }
    warn!("key node collaborator loop stopped");
}

/// Decode and apply one committed operation, then resolve its waiter.
async fn apply_committed(
    store: &Arc<RwLock<Keystore>>,
    pending: &PendingRequests,
    operation: String,
) {
    let digest = Digest::of_bytes(operation.as_bytes());
    let decoded = match Operation::decode(operation.as_bytes()) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(request = ?digest, error = %e, "committed operation does not decode");
            pending.notify(&digest, Err(format!("undecodable operation: {e}")));
            return;
        }
    };

    let outcome = store.write().await.apply(&decoded);
    match &outcome {
        Ok(()) => info!(
            request = ?digest,
            alias = decoded.alias(),
            "applied committed operation"
        ),
        Err(e) => warn!(
            request = ?digest,
            alias = decoded.alias(),
            error = %e,
            "committed operation conflicts with the store"
        ),
    }
    pending.notify(&digest, outcome.map_err(|e| e.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_register_and_notify() {
        let pending = PendingRequests::default();
        let digest = Digest::of_bytes(b"op");
        let rx = pending.register(digest);
        pending.notify(&digest, Ok(()));
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn forgotten_waiter_is_not_notified() {
        let pending = PendingRequests::default();
        let digest = Digest::of_bytes(b"op");
        let rx = pending.register(digest);
        pending.forget(&digest);
        pending.notify(&digest, Ok(()));
        assert!(rx.await.is_err(), "sender was dropped on forget");
    }

    #[tokio::test]
    async fn apply_committed_updates_store_and_notifies() {
        let store = Arc::new(RwLock::new(Keystore::new()));
        let pending = PendingRequests::default();
        let operation = Operation::Create {
            alias: "alice".into(),
            key: "keyA".into(),
        };
        let encoded = String::from_utf8(operation.encode().unwrap()).unwrap();
        let digest = Digest::of_bytes(encoded.as_bytes());
        let rx = pending.register(digest);

        apply_committed(&store, &pending, encoded).await;

        assert_eq!(rx.await.unwrap(), Ok(()));
        assert_eq!(store.read().await.lookup("alice"), Some("keyA"));
    }

    #[tokio::test]
    async fn conflicting_commit_reports_the_error() {
        let store = Arc::new(RwLock::new(Keystore::new()));
        store.write().await.create("alice", "keyA").unwrap();
        let pending = PendingRequests::default();
        let operation = Operation::Create {
            alias: "alice".into(),
            key: "keyB".into(),
        };
        let encoded = String::from_utf8(operation.encode().unwrap()).unwrap();
        let digest = Digest::of_bytes(encoded.as_bytes());
        let rx = pending.register(digest);

        apply_committed(&store, &pending, encoded).await;

        assert!(rx.await.unwrap().is_err());
        // The original binding survives.
        assert_eq!(store.read().await.lookup("alice"), Some("keyA"));
    }
}
