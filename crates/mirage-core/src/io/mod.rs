//! Stream adapters and the bidirectional relay.

pub mod relay;
pub mod rewind;
