//! Trojan authentication and framing.
//!
//! Wire format, once per connection:
//!
//! ```text
//! +-----------------------+---------+----------------+---------+----------+
//! | hex(SHA224(password)) |  CRLF   | Trojan Request |  CRLF   | Payload  |
//! +-----------------------+---------+----------------+---------+----------+
//! |          56           | X'0D0A' |    Variable    | X'0D0A' | Variable |
//! +-----------------------+---------+----------------+---------+----------+
//! ```
//!
//! Any deviation — short hash, unknown hash, bad CRLF, malformed request,
//! exhausted IP budget — rewinds the pre-auth bytes and hands the
//! connection to the redirector, so the decoy origin replays exactly what
//! the client sent.

mod packet;

pub use packet::PacketStream;

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mirage_auth::{Authenticator, User};
use mirage_core::defaults::{CHANNEL_CAPACITY, TROJAN_PEEK_CAPACITY};
use mirage_core::{human_bytes, RewindConn};
use mirage_proto::{Address, Command, Metadata, Network, ProtocolError, CRLF, HASH_LEN, MUX_SENTINEL};

use crate::context::Scope;
use crate::error::TunnelError;
use crate::redirect::Redirector;
use crate::tls::ensure_reachable;
use crate::transport::send_or_cancel;
use crate::{BoxConn, BoxPacket, StreamConn, TunnelKind, TunnelServer};

/// An authenticated trojan connection.
///
/// Reads and writes pass straight through to the carrier while the
/// per-connection and per-user counters accumulate. Dropping the
/// connection releases the client IP from the user's set and logs the
/// traffic totals.
pub struct InboundConn {
    inner: RewindConn<BoxConn>,
    user: Arc<User>,
    metadata: Metadata,
    peer: Option<SocketAddr>,
    ip: Option<IpAddr>,
    sent: AtomicU64,
    recv: AtomicU64,
}

/// A failed handshake, carrying the rewound stream for the redirector.
pub struct AuthFailure {
    pub conn: RewindConn<BoxConn>,
    pub error: TunnelError,
}

impl InboundConn {
    /// Run the exactly-once authentication sequence on a fresh carrier
    /// connection.
    pub async fn authenticate(
        conn: BoxConn,
        auth: &Arc<dyn Authenticator>,
    ) -> Result<InboundConn, AuthFailure> {
        let peer = conn.peer_addr();
        let mut rewind = RewindConn::new(conn, TROJAN_PEEK_CAPACITY);
        match read_header(&mut rewind, auth, peer).await {
            Ok((user, metadata, ip)) => {
                rewind.stop_buffering();
                Ok(InboundConn {
                    inner: rewind,
                    user,
                    metadata,
                    peer,
                    ip,
                    sent: AtomicU64::new(0),
                    recv: AtomicU64::new(0),
                })
            }
            Err(error) => Err(AuthFailure {
                conn: rewind,
                error,
            }),
        }
    }

    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn recv(&self) -> u64 {
        self.recv.load(Ordering::Relaxed)
    }
}

async fn read_header(
    conn: &mut RewindConn<BoxConn>,
    auth: &Arc<dyn Authenticator>,
    peer: Option<SocketAddr>,
) -> Result<(Arc<User>, Metadata, Option<IpAddr>), TunnelError> {
    let mut hash = [0u8; HASH_LEN];
    conn.read_exact(&mut hash)
        .await
        .map_err(|err| TunnelError::Protocol(ProtocolError::Io(err)))?;
    let hash = match std::str::from_utf8(&hash) {
        Ok(hash) => hash,
        Err(_) => return Err(TunnelError::AuthFailed),
    };

    let user = auth
        .auth_user(hash)
        .await
        .map_err(|_| TunnelError::AuthFailed)?;

    let ip = peer.map(|addr| addr.ip());
    if let Some(ip) = ip {
        if !user.add_ip(ip) {
            return Err(TunnelError::IpLimit);
        }
    }

    // From here on a registered IP must not leak on failure.
    match read_request(conn).await {
        Ok(metadata) => Ok((user, metadata, ip)),
        Err(err) => {
            if let Some(ip) = ip {
                user.del_ip(&ip);
            }
            Err(err)
        }
    }
}

async fn read_request(conn: &mut RewindConn<BoxConn>) -> Result<Metadata, TunnelError> {
    expect_crlf(conn).await?;
    let metadata = Metadata::read_from(conn).await?;
    expect_crlf(conn).await?;
    Ok(metadata)
}

async fn expect_crlf(conn: &mut RewindConn<BoxConn>) -> Result<(), TunnelError> {
    let mut crlf = [0u8; 2];
    conn.read_exact(&mut crlf)
        .await
        .map_err(|err| TunnelError::Protocol(ProtocolError::Io(err)))?;
    if &crlf != CRLF {
        return Err(TunnelError::Protocol(ProtocolError::InvalidCrlf));
    }
    Ok(())
}

impl StreamConn for InboundConn {
    fn metadata(&self) -> Option<&Metadata> {
        Some(&self.metadata)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl AsyncRead for InboundConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = &mut *self;
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                me.recv.fetch_add(n, Ordering::Relaxed);
                me.user.add_traffic(0, n);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for InboundConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let me = &mut *self;
        match Pin::new(&mut me.inner).poll_write(cx, data) {
            Poll::Ready(Ok(n)) => {
                me.sent.fetch_add(n as u64, Ordering::Relaxed);
                me.user.add_traffic(n as u64, 0);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Drop for InboundConn {
    fn drop(&mut self) {
        if let Some(ip) = self.ip {
            self.user.del_ip(&ip);
        }
        info!(
            user = self.user.hash(),
            peer = ?self.peer,
            target = %self.metadata.address,
            sent = %human_bytes(self.sent()),
            recv = %human_bytes(self.recv()),
            "tunnel closed"
        );
    }
}

pub struct TrojanServer {
    conn_rx: tokio::sync::Mutex<mpsc::Receiver<BoxConn>>,
    mux_rx: tokio::sync::Mutex<mpsc::Receiver<BoxConn>>,
    packet_rx: tokio::sync::Mutex<mpsc::Receiver<BoxPacket>>,
    underlay: Arc<dyn TunnelServer>,
    token: CancellationToken,
}

impl TrojanServer {
    pub async fn new(
        scope: &Scope,
        underlay: Arc<dyn TunnelServer>,
    ) -> Result<Self, TunnelError> {
        let config = scope.config();
        let fallback = Address::domain(
            config.remote_addr.clone(),
            config.remote_port,
            Network::Tcp,
        );
        ensure_reachable(&fallback).await?;

        let token = scope.token().child_token();
        let (conn_tx, conn_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (mux_tx, mux_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (packet_tx, packet_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let loop_state = AcceptLoop {
            underlay: underlay.clone(),
            auth: scope.auth(),
            redirector: Redirector::new(token.clone()),
            fallback,
            conn_tx,
            mux_tx,
            packet_tx,
            token: token.clone(),
        };
        tokio::spawn(loop_state.run());
        debug!("trojan server created");

        Ok(Self {
            conn_rx: tokio::sync::Mutex::new(conn_rx),
            mux_rx: tokio::sync::Mutex::new(mux_rx),
            packet_rx: tokio::sync::Mutex::new(packet_rx),
            underlay,
            token,
        })
    }
}

#[async_trait]
impl TunnelServer for TrojanServer {
    async fn accept_conn(&self, next: Option<TunnelKind>) -> Result<BoxConn, TunnelError> {
        let rx = if next == Some(TunnelKind::Mux) {
            &self.mux_rx
        } else {
            &self.conn_rx
        };
        let mut rx = rx.lock().await;
        tokio::select! {
            conn = rx.recv() => conn.ok_or(TunnelError::Cancelled),
            _ = self.token.cancelled() => Err(TunnelError::Cancelled),
        }
    }

    async fn accept_packet(&self, _next: Option<TunnelKind>) -> Result<BoxPacket, TunnelError> {
        let mut rx = self.packet_rx.lock().await;
        tokio::select! {
            packet = rx.recv() => packet.ok_or(TunnelError::Cancelled),
            _ = self.token.cancelled() => Err(TunnelError::Cancelled),
        }
    }

    fn close(&self) {
        self.token.cancel();
        self.underlay.close();
    }
}

struct AcceptLoop {
    underlay: Arc<dyn TunnelServer>,
    auth: Arc<dyn Authenticator>,
    redirector: Redirector,
    fallback: Address,
    conn_tx: mpsc::Sender<BoxConn>,
    mux_tx: mpsc::Sender<BoxConn>,
    packet_tx: mpsc::Sender<BoxPacket>,
    token: CancellationToken,
}

impl AcceptLoop {
    async fn run(self) {
        let state = Arc::new(self);
        loop {
            let conn = tokio::select! {
                _ = state.token.cancelled() => break,
                res = state.underlay.accept_conn(Some(TunnelKind::Trojan)) => res,
            };
            match conn {
                Ok(conn) => {
                    // A slow or hostile handshake must not stall the
                    // listener.
                    let state = state.clone();
                    tokio::spawn(async move { state.handle(conn).await });
                }
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    debug!(error = %err, "trojan underlay accept error");
                    continue;
                }
            }
        }
        debug!("trojan accept loop exiting");
    }

    async fn handle(&self, conn: BoxConn) {
        let peer = conn.peer_addr();
        let inbound = match InboundConn::authenticate(conn, &self.auth).await {
            Ok(inbound) => inbound,
            Err(AuthFailure { mut conn, error }) => {
                warn!(peer = ?peer, error = %error, "invalid trojan header, redirecting");
                conn.rewind();
                conn.stop_buffering();
                self.redirector.redirect(Box::new(conn), self.fallback.clone());
                return;
            }
        };

        match inbound.metadata.command {
            Command::Connect if inbound.metadata.address.is_domain(MUX_SENTINEL) => {
                debug!(peer = ?peer, "mux carrier connection");
                send_or_cancel(&self.mux_tx, Box::new(inbound), &self.token).await;
            }
            Command::Connect => {
                debug!(peer = ?peer, target = %inbound.metadata.address, "trojan connection");
                send_or_cancel(&self.conn_tx, Box::new(inbound), &self.token).await;
            }
            Command::Associate => {
                debug!(peer = ?peer, "trojan udp association");
                let packet: BoxPacket = Box::new(PacketStream::new(Box::new(inbound)));
                send_or_cancel(&self.packet_tx, packet, &self.token).await;
            }
            Command::Mux => {
                debug!(peer = ?peer, "mux carrier connection");
                send_or_cancel(&self.mux_tx, Box::new(inbound), &self.token).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirage_auth::{sha224_hex, MemoryAuthenticator};
    use mirage_proto::write_request;
    use bytes::BytesMut;
    use tokio::io::{duplex, AsyncWriteExt};

    fn authenticator(passwords: &[&str]) -> Arc<dyn Authenticator> {
        Arc::new(MemoryAuthenticator::from_passwords(passwords.iter().copied()))
    }

    fn connect_request(password: &str, host: &str, port: u16) -> BytesMut {
        let metadata = Metadata {
            command: Command::Connect,
            address: Address::domain(host, port, Network::Tcp),
        };
        let mut buf = BytesMut::new();
        write_request(&mut buf, sha224_hex(password).as_bytes(), &metadata).unwrap();
        buf
    }

    #[tokio::test]
    async fn valid_header_authenticates_and_exposes_payload() {
        let auth = authenticator(&["hunter2"]);
        let (mut client, server) = duplex(1024);

        let mut request = connect_request("hunter2", "example.com", 443);
        request.extend_from_slice(b"GET / HTTP/1.1\r\n");
        client.write_all(&request).await.unwrap();

        let mut inbound = InboundConn::authenticate(Box::new(server), &auth)
            .await
            .map_err(|f| f.error)
            .unwrap();
        let metadata = inbound.metadata().unwrap();
        assert_eq!(metadata.command, Command::Connect);
        assert_eq!(metadata.address, Address::domain("example.com", 443, Network::Tcp));

        let mut payload = [0u8; 16];
        inbound.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"GET / HTTP/1.1\r\n");
        assert_eq!(inbound.recv(), 16);
        assert_eq!(inbound.user().recv(), 16);
    }

    #[tokio::test]
    async fn unknown_hash_fails_and_rewinds_every_byte() {
        let auth = authenticator(&["hunter2"]);
        let (mut client, server) = duplex(1024);

        let mut probe = vec![b'x'; HASH_LEN];
        probe.extend_from_slice(b"\r\njunk-that-follows");
        client.write_all(&probe).await.unwrap();

        let failure = match InboundConn::authenticate(Box::new(server), &auth).await {
            Err(failure) => failure,
            Ok(_) => panic!("bogus hash must not authenticate"),
        };
        assert!(matches!(failure.error, TunnelError::AuthFailed));

        let mut conn = failure.conn;
        conn.rewind();
        conn.stop_buffering();
        let mut replay = vec![0u8; HASH_LEN];
        conn.read_exact(&mut replay).await.unwrap();
        assert_eq!(replay, vec![b'x'; HASH_LEN]);
    }

    #[tokio::test]
    async fn bad_crlf_after_hash_is_a_protocol_violation() {
        let auth = authenticator(&["hunter2"]);
        let (mut client, server) = duplex(1024);

        let mut request = sha224_hex("hunter2").into_bytes();
        request.extend_from_slice(b"XX");
        client.write_all(&request).await.unwrap();
        client.shutdown().await.unwrap();

        let failure = match InboundConn::authenticate(Box::new(server), &auth).await {
            Err(failure) => failure,
            Ok(_) => panic!("bad CRLF must not authenticate"),
        };
        assert!(matches!(
            failure.error,
            TunnelError::Protocol(ProtocolError::InvalidCrlf)
        ));
    }

    #[tokio::test]
    async fn short_hash_is_a_protocol_violation() {
        let auth = authenticator(&["hunter2"]);
        let (mut client, server) = duplex(1024);
        client.write_all(b"too short").await.unwrap();
        client.shutdown().await.unwrap();

        let failure = match InboundConn::authenticate(Box::new(server), &auth).await {
            Err(failure) => failure,
            Ok(_) => panic!("short read must not authenticate"),
        };
        assert!(matches!(failure.error, TunnelError::Protocol(_)));
    }

    #[tokio::test]
    async fn malformed_request_does_not_leak_ip_slots() {
        let auth = authenticator(&["hunter2"]);
        let user = auth.auth_user(&sha224_hex("hunter2")).await.unwrap();
        user.set_ip_limit(1);

        // No peer address on a duplex pipe, so exercise the cleanup path
        // directly through the header reader with a synthetic peer.
        let (mut client, server) = duplex(1024);
        let mut request = sha224_hex("hunter2").into_bytes();
        request.extend_from_slice(b"\r\n\x7a"); // unknown command
        client.write_all(&request).await.unwrap();
        client.shutdown().await.unwrap();

        let peer: SocketAddr = "192.0.2.7:50000".parse().unwrap();
        let mut rewind = RewindConn::new(Box::new(server) as BoxConn, TROJAN_PEEK_CAPACITY);
        let err = read_header(&mut rewind, &auth, Some(peer)).await.unwrap_err();
        assert!(matches!(err, TunnelError::Protocol(_)));
        assert_eq!(user.ip_count(), 0, "failed auth must unregister the IP");
    }

    #[tokio::test]
    async fn ip_limit_refuses_before_any_payload() {
        let auth = authenticator(&["hunter2"]);
        let user = auth.auth_user(&sha224_hex("hunter2")).await.unwrap();
        user.set_ip_limit(1);
        assert!(user.add_ip("198.51.100.1".parse().unwrap()));

        let (mut client, server) = duplex(1024);
        client
            .write_all(&connect_request("hunter2", "example.com", 443))
            .await
            .unwrap();

        let peer: SocketAddr = "192.0.2.7:50000".parse().unwrap();
        let mut rewind = RewindConn::new(Box::new(server) as BoxConn, TROJAN_PEEK_CAPACITY);
        let err = read_header(&mut rewind, &auth, Some(peer)).await.unwrap_err();
        assert!(matches!(err, TunnelError::IpLimit));
        assert_eq!(user.ip_count(), 1);
    }

    #[tokio::test]
    async fn dropping_the_conn_releases_the_ip() {
        let auth = authenticator(&["hunter2"]);
        let user = auth.auth_user(&sha224_hex("hunter2")).await.unwrap();

        let (mut client, server) = duplex(1024);
        client
            .write_all(&connect_request("hunter2", "example.com", 443))
            .await
            .unwrap();

        let peer: SocketAddr = "192.0.2.7:50000".parse().unwrap();
        let mut rewind = RewindConn::new(Box::new(server) as BoxConn, TROJAN_PEEK_CAPACITY);
        let (got_user, metadata, ip) = read_header(&mut rewind, &auth, Some(peer)).await.unwrap();
        assert_eq!(user.ip_count(), 1);

        let inbound = InboundConn {
            inner: rewind,
            user: got_user,
            metadata,
            peer: Some(peer),
            ip,
            sent: AtomicU64::new(0),
            recv: AtomicU64::new(0),
        };
        drop(inbound);
        assert_eq!(user.ip_count(), 0);
    }
}
