//! Debug-introspection snapshot of replica state.

use keygrid_pbft::ReplicaState;
use serde::Serialize;

/// The JSON body served on `/debug/<endpoint>`.
///
/// Refreshed by the event loop after each handled event; reads never touch
/// protocol state.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ReplicaStatus {
    pub node: u32,
    pub view_number: u64,
    pub primary: bool,
    pub view_change_in_progress: bool,
    pub sequence_number: u64,
    pub delivered: u64,
    pub stable_checkpoint_seq: u64,
    pub log_slots: usize,
}

impl ReplicaStatus {
    pub fn snapshot(state: &ReplicaState) -> Self {
        Self {
            node: state.local_id().0,
            view_number: state.view_number().0,
            primary: state.is_primary(),
            view_change_in_progress: state.view_change_in_progress(),
            sequence_number: state.sequence_number().0,
            delivered: state.delivered().0,
            stable_checkpoint_seq: state.stable_checkpoint().number.seq_number.0,
            log_slots: state.log().len(),
        }
    }
}
