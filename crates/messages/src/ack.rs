//! RPC response bodies.

use keygrid_types::SeqNumber;
use serde::{Deserialize, Serialize};

/// Plain acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

/// Acknowledgement carrying the responder's delivered sequence number, so
/// the primary can track peer catch-up from pre-prepare and heartbeat
/// replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqAck {
    pub seq_number: SeqNumber,
}
