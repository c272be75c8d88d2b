//! Stream multiplexing over one authenticated carrier connection.
//!
//! A client marks a trojan connection as a carrier (the `MUX_CONN`
//! sentinel or the dedicated command byte) and runs framed sessions over
//! it. Every accepted sub-stream opens with its own inner request — the
//! trojan header minus hash and CRLFs — and becomes an independent upper
//! connection.

use std::future::poll_fn;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mirage_core::defaults::CHANNEL_CAPACITY;
use mirage_proto::{Command, Metadata};

use crate::context::Scope;
use crate::error::TunnelError;
use crate::transport::send_or_cancel;
use crate::trojan::PacketStream;
use crate::{BoxConn, BoxPacket, StreamConn, TunnelKind, TunnelServer};

pub struct MuxServer {
    conn_rx: tokio::sync::Mutex<mpsc::Receiver<BoxConn>>,
    packet_rx: tokio::sync::Mutex<mpsc::Receiver<BoxPacket>>,
    underlay: Arc<dyn TunnelServer>,
    token: CancellationToken,
}

impl MuxServer {
    pub fn new(scope: &Scope, underlay: Arc<dyn TunnelServer>) -> Self {
        let token = scope.token().child_token();
        let (conn_tx, conn_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (packet_tx, packet_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(accept_loop(
            underlay.clone(),
            conn_tx,
            packet_tx,
            token.clone(),
        ));
        debug!("mux server created");

        Self {
            conn_rx: tokio::sync::Mutex::new(conn_rx),
            packet_rx: tokio::sync::Mutex::new(packet_rx),
            underlay,
            token,
        }
    }
}

#[async_trait]
impl TunnelServer for MuxServer {
    async fn accept_conn(&self, _next: Option<TunnelKind>) -> Result<BoxConn, TunnelError> {
        let mut rx = self.conn_rx.lock().await;
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

async fn accept_loop(
    underlay: Arc<dyn TunnelServer>,
    conn_tx: mpsc::Sender<BoxConn>,
    packet_tx: mpsc::Sender<BoxPacket>,
    token: CancellationToken,
) {
    loop {
        let carrier = tokio::select! {
            _ = token.cancelled() => break,
            res = underlay.accept_conn(Some(TunnelKind::Mux)) => res,
        };
        match carrier {
            Ok(carrier) => {
                tokio::spawn(run_session(
                    carrier,
                    conn_tx.clone(),
                    packet_tx.clone(),
                    token.clone(),
                ));
            }
            Err(err) if err.is_cancelled() => break,
            Err(err) => {
                debug!(error = %err, "mux underlay accept error");
                continue;
            }
        }
    }
    debug!("mux accept loop exiting");
}

/// Drive one framed session: the poll loop both yields inbound sub-streams
/// and pumps I/O for the ones already running. Ending the session closes
/// every sub-stream along with the carrier.
async fn run_session(
    carrier: BoxConn,
    conn_tx: mpsc::Sender<BoxConn>,
    packet_tx: mpsc::Sender<BoxPacket>,
    token: CancellationToken,
) {
    let peer = carrier.peer_addr();
    let mut session = yamux::Connection::new(
        carrier.compat(),
        yamux::Config::default(),
        yamux::Mode::Server,
    );
    debug!(peer = ?peer, "mux session started");

    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => break,
            next = poll_fn(|cx| session.poll_next_inbound(cx)) => match next {
                Some(Ok(stream)) => stream,
                Some(Err(err)) => {
                    debug!(peer = ?peer, error = %err, "mux session error");
                    break;
                }
                None => break,
            },
        };

        // The inner request is read on its own task; blocking here would
        // stall the session driver that feeds it.
        let conn_tx = conn_tx.clone();
        let packet_tx = packet_tx.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let mut io = stream.compat();
            let metadata = match Metadata::read_from(&mut io).await {
                Ok(metadata) => metadata,
                Err(err) => {
                    debug!(error = %err, "bad mux sub-stream request");
                    return;
                }
            };
            let conn = MuxConn {
                io,
                metadata,
                peer,
            };
            match conn.metadata.command {
                Command::Connect => {
                    send_or_cancel(&conn_tx, Box::new(conn), &token).await;
                }
                Command::Associate => {
                    let packet: BoxPacket = Box::new(PacketStream::new(Box::new(conn)));
                    send_or_cancel(&packet_tx, packet, &token).await;
                }
                Command::Mux => {
                    warn!("nested mux sub-stream dropped");
                }
            }
        });
    }
    debug!(peer = ?peer, "mux session closed");
}

/// One sub-stream of a mux session, carrying its own target metadata.
struct MuxConn {
    io: Compat<yamux::Stream>,
    metadata: Metadata,
    peer: Option<SocketAddr>,
}

impl StreamConn for MuxConn {
    fn metadata(&self) -> Option<&Metadata> {
        Some(&self.metadata)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl AsyncRead for MuxConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use futures_util::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use mirage_proto::{Address, Network};
    use tokio::io::{duplex, AsyncReadExt as _, AsyncWriteExt as _};

    /// Open a client-side yamux session over a duplex pipe and exercise a
    /// CONNECT sub-stream end to end.
    #[tokio::test]
    async fn sub_streams_carry_their_own_requests() {
        let (client_io, server_io) = duplex(16 * 1024);

        let (conn_tx, mut conn_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (packet_tx, _packet_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let token = CancellationToken::new();
        tokio::spawn(run_session(
            Box::new(server_io),
            conn_tx,
            packet_tx,
            token.clone(),
        ));

        let mut client =
            yamux::Connection::new(client_io.compat(), yamux::Config::default(), yamux::Mode::Client);

        let mut stream = poll_fn(|cx| client.poll_new_outbound(cx)).await.unwrap();
        let driver = tokio::spawn(async move {
            while let Some(res) = poll_fn(|cx| client.poll_next_inbound(cx)).await {
                if res.is_err() {
                    break;
                }
            }
        });

        let metadata = Metadata {
            command: Command::Connect,
            address: Address::domain("example.com", 443, Network::Tcp),
        };
        let mut request = BytesMut::new();
        metadata.write_to(&mut request).unwrap();
        request.extend_from_slice(b"payload");
        stream.write_all(&request).await.unwrap();
        stream.flush().await.unwrap();

        let mut accepted = conn_rx.recv().await.unwrap();
        assert_eq!(accepted.metadata().unwrap(), &metadata);

        let mut payload = [0u8; 7];
        accepted.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"payload");

        // And the reverse direction flows too.
        accepted.write_all(b"reply").await.unwrap();
        tokio::io::AsyncWriteExt::flush(&mut accepted).await.unwrap();
        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");

        token.cancel();
        driver.abort();
    }
}
