//! Pipeline error kinds.

use mirage_proto::ProtocolError;

/// Everything that can go wrong between accept and relay.
///
/// Configuration errors abort startup; all other variants are
/// per-connection and end at a warn/debug log line.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("authentication failed")]
    AuthFailed,
    #[error("concurrent IP limit reached")]
    IpLimit,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("websocket handshake failed: {0}")]
    WsHandshake(String),
    #[error("fallback origin unavailable: {0}")]
    FallbackUnavailable(String),
    #[error("upstream connection closed")]
    UpstreamClosed,
    #[error("configuration: {0}")]
    Config(String),
    #[error("server closed")]
    Cancelled,
    #[error("packet streams not supported by this layer")]
    NotSupported,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// True when the error only reports an orderly shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TunnelError::Cancelled)
    }
}
