//! Transport-level stream adapters.

mod ws;

pub use ws::WsStream;
