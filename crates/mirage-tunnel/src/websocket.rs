//! WebSocket upgrade layer over the decrypted TLS stream.
//!
//! The HTTP request that the TLS demux routed here is validated before the
//! upgrade: the `Upgrade` header must name `websocket` and the path must
//! equal the configured one exactly. Anything else is rewound and replayed
//! to the decoy origin, exactly like a failed trojan handshake.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mirage_core::defaults::{
    REQUEST_PEEK_CAPACITY, WS_HANDSHAKE_TIMEOUT_MAX_SECS, WS_HANDSHAKE_TIMEOUT_MIN_SECS,
};
use mirage_core::transport::WsStream;
use mirage_core::RewindConn;
use mirage_proto::{Address, Network};

use crate::context::Scope;
use crate::error::TunnelError;
use crate::http::peek_request_head;
use crate::redirect::Redirector;
use crate::{BoxConn, StreamConn, TunnelKind, TunnelServer};

pub struct WebsocketServer {
    underlay: Arc<dyn TunnelServer>,
    enabled: bool,
    path: String,
    /// Picked once at startup to resist timing fingerprints; never
    /// adjusted afterwards.
    handshake_timeout: Duration,
    redirector: Redirector,
    fallback: Address,
    token: CancellationToken,
}

impl WebsocketServer {
    pub fn new(scope: &Scope, underlay: Arc<dyn TunnelServer>) -> Result<Self, TunnelError> {
        let config = scope.config();
        if config.websocket.enabled && !config.websocket.path.starts_with('/') {
            return Err(TunnelError::Config(
                "websocket path must start with \"/\"".to_string(),
            ));
        }
        let token = scope.token().child_token();
        let timeout_secs = rand::thread_rng()
            .gen_range(WS_HANDSHAKE_TIMEOUT_MIN_SECS..=WS_HANDSHAKE_TIMEOUT_MAX_SECS);
        debug!(timeout_secs, "websocket server created");
        Ok(Self {
            underlay,
            enabled: config.websocket.enabled,
            path: config.websocket.path.clone(),
            handshake_timeout: Duration::from_secs(timeout_secs),
            redirector: Redirector::new(token.clone()),
            fallback: Address::domain(
                config.remote_addr.clone(),
                config.remote_port,
                Network::Tcp,
            ),
            token,
        })
    }
}

#[async_trait]
impl TunnelServer for WebsocketServer {
    async fn accept_conn(&self, _next: Option<TunnelKind>) -> Result<BoxConn, TunnelError> {
        let conn = self.underlay.accept_conn(Some(TunnelKind::Websocket)).await?;
        let peer = conn.peer_addr();

        if !self.enabled {
            self.redirector.redirect(conn, self.fallback.clone());
            return Err(TunnelError::Config(
                "websocket is disabled, http request redirected".to_string(),
            ));
        }

        let mut rewind = RewindConn::new(conn, REQUEST_PEEK_CAPACITY);
        let head = peek_request_head(&mut rewind).await?;
        let valid = head
            .as_ref()
            .map(|head| head.upgrades_to_websocket() && head.path_only() == self.path)
            .unwrap_or(false);
        if !valid {
            debug!(peer = ?peer, path = ?head.as_ref().map(|h| h.path_only()), "invalid websocket handshake request");
            rewind.rewind();
            rewind.stop_buffering();
            self.redirector
                .redirect(Box::new(rewind), self.fallback.clone());
            return Err(TunnelError::WsHandshake(
                "not a websocket upgrade for the configured path".to_string(),
            ));
        }

        // Replay the request head; tungstenite re-reads it and answers the
        // upgrade itself.
        rewind.rewind();
        rewind.stop_buffering();

        let upgrade = accept_hdr_async(
            Box::new(rewind) as BoxConn,
            |req: &Request, resp: Response| {
                debug!(path = %req.uri().path(), "websocket upgrade");
                Ok(resp)
            },
        );
        let ws = tokio::select! {
            res = tokio::time::timeout(self.handshake_timeout, upgrade) => match res {
                Ok(Ok(ws)) => ws,
                Ok(Err(err)) => {
                    return Err(TunnelError::WsHandshake(err.to_string()));
                }
                Err(_) => {
                    warn!(peer = ?peer, "websocket handshake timed out");
                    return Err(TunnelError::HandshakeTimeout);
                }
            },
            _ = self.token.cancelled() => return Err(TunnelError::Cancelled),
        };

        Ok(Box::new(WsConn {
            io: WsStream::new(ws),
            peer,
        }))
    }

    fn close(&self) {
        self.token.cancel();
        self.underlay.close();
    }
}

/// A WebSocket session exposed to the trojan layer as a byte stream.
struct WsConn {
    io: WsStream<BoxConn>,
    peer: Option<SocketAddr>,
}

impl StreamConn for WsConn {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl AsyncRead for WsConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for WsConn {
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
