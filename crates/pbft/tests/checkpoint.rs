//! Checkpointing and state-transfer scenarios.

mod common;

use common::{op, Cluster};
use keygrid_pbft::PbftConfig;
use keygrid_types::SeqNumber;
use tracing_test::traced_test;

fn small_interval_config() -> PbftConfig {
    PbftConfig {
        checkpoint_interval: 2,
        ..Default::default()
    }
}

/// Every `checkpoint_interval` deliveries the replicas attest, stabilize,
/// and truncate the log.
#[traced_test]
#[test]
fn checkpoint_stabilizes_and_truncates() {
    let mut cluster = Cluster::with_config(4, small_interval_config());

    cluster.propose(0, &op("create", "alice", "keyA"));
    // One delivery: no checkpoint yet, the slot is still in the log.
    for node in 0..4 {
        assert_eq!(cluster.nodes[node].stable_checkpoint().number.seq_number.0, 0);
        assert_eq!(cluster.nodes[node].log().len(), 1);
    }

    cluster.propose(0, &op("create", "bob", "keyB"));
    // Second delivery crosses the interval: checkpoints fly, 2f+1 match,
    // and the log is garbage-collected through seq 2.
    for node in 0..4 {
        assert_eq!(
            cluster.nodes[node].stable_checkpoint().number.seq_number,
            SeqNumber(2),
            "node {node} stable checkpoint"
        );
        assert!(cluster.nodes[node].log().is_empty(), "node {node} log");
        assert_eq!(
            cluster.nodes[node].stable_checkpoint().state_digest,
            cluster.nodes[0].stable_checkpoint().state_digest,
            "state digests must agree"
        );
    }
}

/// A replica that misses an entire checkpoint interval learns of the
/// stable checkpoint, fetches a snapshot from a witness, and resumes
/// from the checkpoint without replaying what it missed.
#[traced_test]
#[test]
fn lagging_replica_recovers_via_snapshot() {
    let mut cluster = Cluster::with_config(4, small_interval_config());

    // Node 3 misses the first interval entirely.
    for from in 0..3 {
        cluster.block_link(from, 3);
    }
    cluster.propose(0, &op("create", "alice", "keyA"));
    cluster.propose(0, &op("create", "bob", "keyB"));
    assert!(cluster.delivered[3].is_empty());
    assert_eq!(cluster.nodes[3].delivered(), SeqNumber(0));

    // Reconnect; the next interval's traffic reaches node 3, whose
    // delivery stalls on the gap until the checkpoint at seq 4 becomes
    // stable and triggers a snapshot fetch.
    for from in 0..3 {
        cluster.unblock_link(from, 3);
    }
    cluster.propose(0, &op("create", "carol", "keyC"));
    cluster.propose(0, &op("create", "dave", "keyD"));

    assert_eq!(cluster.nodes[3].delivered(), SeqNumber(4));
    assert_eq!(
        cluster.installed_snapshots[3],
        vec!["keystore-at-4".to_string()],
        "node 3 must install the witness snapshot"
    );
    assert_eq!(
        cluster.nodes[3].state_digest(),
        cluster.nodes[0].state_digest(),
        "state transfer must converge the digests"
    );

    // The recovered replica participates normally afterwards.
    cluster.propose(0, &op("create", "erin", "keyE"));
    assert_eq!(
        cluster.delivered[3].last().map(String::as_str),
        Some(op("create", "erin", "keyE").as_str())
    );
    assert_eq!(cluster.nodes[3].delivered(), SeqNumber(5));
}
