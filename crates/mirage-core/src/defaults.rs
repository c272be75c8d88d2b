//! Default constants shared across the workspace.

/// Capacity of the bounded channels between tunnel layers.
///
/// Slow consumers propagate backpressure to the accept loops through this
/// bound; it is a load-bearing default, not an arbitrary one.
pub const CHANNEL_CAPACITY: usize = 32;

/// Maximum datagram payload relayed in one read (8 KiB).
pub const MAX_PACKET_SIZE: usize = 8 * 1024;

/// Upper bound on buffered packet-framing bytes before a peer is dropped.
pub const MAX_PACKET_BUFFER_BYTES: usize = 64 * 1024;

/// Rewind look-ahead while deciding whether an inbound stream is TLS.
pub const TLS_PEEK_CAPACITY: usize = 2048;

/// Rewind look-ahead for the post-handshake HTTP/trojan demux.
pub const HTTP_PEEK_CAPACITY: usize = 1024;

/// Rewind look-ahead for HTTP request inspection (WebSocket, plaintext).
pub const REQUEST_PEEK_CAPACITY: usize = 512;

/// Rewind look-ahead covering the trojan auth header.
pub const TROJAN_PEEK_CAPACITY: usize = 512;

/// Bounds of the per-server randomised WebSocket handshake timeout (seconds).
pub const WS_HANDSHAKE_TIMEOUT_MIN_SECS: u64 = 5;
pub const WS_HANDSHAKE_TIMEOUT_MAX_SECS: u64 = 14;

/// Default TCP keepalive interval in seconds when enabled.
pub const TCP_KEEPALIVE_SECS: u64 = 300;
