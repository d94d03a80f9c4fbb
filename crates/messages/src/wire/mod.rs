//! Protocol payload definitions, one module per message family.

pub mod checkpoint;
pub mod client;
pub mod three_phase;
pub mod view_change;
