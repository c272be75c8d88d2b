//! Shared building blocks for the mirage proxy.
//!
//! This crate carries the pieces every tunnel layer leans on: the rewind
//! stream adapter used by all peek-then-decide paths, the bidirectional
//! relay, the WebSocket byte-stream adapter and the workspace-wide default
//! constants.

pub mod defaults;
pub mod io;
pub mod traffic;
pub mod transport;

pub use io::relay::relay_stream;
pub use io::rewind::RewindConn;
pub use traffic::human_bytes;
