//! The layered tunnel pipeline.
//!
//! A tunnel is a protocol layer with two roles: a server side that accepts
//! connections wrapped in the next lower layer's connections, and a client
//! side that dials outbound through the next lower client. A concrete
//! server is a tree of tunnels: one transport listener at the root and one
//! branch per co-located variant (plain trojan, WebSocket-wrapped trojan,
//! multiplexed trojan). Leaves of the tree yield authenticated application
//! connections that the proxy engine bridges to the outbound client stack.

pub mod context;
pub mod error;
pub mod freedom;
mod http;
pub mod mux;
pub mod proxy;
pub mod redirect;
pub mod tls;
pub mod transport;
pub mod trojan;
pub mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use mirage_core::RewindConn;
use mirage_proto::{Address, Metadata};

pub use context::Scope;
pub use error::TunnelError;
pub use proxy::{build_server_proxy, Proxy};

/// A byte-stream connection travelling through the pipeline.
///
/// Layers that know the logical target (trojan, mux) expose it through
/// `metadata()`; plain transport wrappers return `None` and forward the
/// peer address of the socket underneath.
pub trait StreamConn: AsyncRead + AsyncWrite + Send + Unpin {
    fn metadata(&self) -> Option<&Metadata> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

pub type BoxConn = Box<dyn StreamConn>;

impl std::fmt::Debug for dyn StreamConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConn")
            .field("peer_addr", &self.peer_addr())
            .finish()
    }
}

/// A datagram connection with per-packet target metadata.
///
/// Both directions may be driven concurrently; implementations synchronise
/// internally.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn read_with_metadata(&self, buf: &mut [u8]) -> Result<(usize, Metadata), TunnelError>;

    async fn write_with_metadata(
        &self,
        payload: &[u8],
        metadata: &Metadata,
    ) -> Result<usize, TunnelError>;
}

pub type BoxPacket = Box<dyn PacketConn>;

/// Server side of a tunnel layer.
#[async_trait]
pub trait TunnelServer: Send + Sync {
    /// Take the next connection destined for the `next` upper layer.
    ///
    /// The hint lets a lower layer route to one of several upper branches
    /// (TLS branching to trojan vs. WebSocket); layers that do not branch
    /// ignore it.
    async fn accept_conn(&self, next: Option<TunnelKind>) -> Result<BoxConn, TunnelError>;

    /// Take the next datagram connection. Most layers do not produce any.
    async fn accept_packet(&self, next: Option<TunnelKind>) -> Result<BoxPacket, TunnelError> {
        let _ = next;
        Err(TunnelError::NotSupported)
    }

    /// Stop accepting and tear down the layer and its underlay.
    fn close(&self);
}

/// Client side of a tunnel layer.
#[async_trait]
pub trait TunnelClient: Send + Sync {
    async fn dial_conn(
        &self,
        address: &Address,
        next: Option<TunnelKind>,
    ) -> Result<BoxConn, TunnelError>;

    async fn dial_packet(&self, next: Option<TunnelKind>) -> Result<BoxPacket, TunnelError> {
        let _ = next;
        Err(TunnelError::NotSupported)
    }

    fn close(&self);
}

/// The tunnel registry: every layer this build can construct.
///
/// Registration is the enum itself; lookups happen once at startup and a
/// miss is a fatal configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelKind {
    Transport,
    Tls,
    Websocket,
    Trojan,
    Mux,
    Freedom,
}

impl TunnelKind {
    pub const ALL: [TunnelKind; 6] = [
        TunnelKind::Transport,
        TunnelKind::Tls,
        TunnelKind::Websocket,
        TunnelKind::Trojan,
        TunnelKind::Mux,
        TunnelKind::Freedom,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TunnelKind::Transport => "TRANSPORT",
            TunnelKind::Tls => "TLS",
            TunnelKind::Websocket => "WEBSOCKET",
            TunnelKind::Trojan => "TROJAN",
            TunnelKind::Mux => "MUX",
            TunnelKind::Freedom => "FREEDOM",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, TunnelError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| TunnelError::Config(format!("unknown tunnel {name:?}")))
    }

    /// Construct the server side of this layer on top of `underlay`.
    pub async fn new_server(
        self,
        scope: &Scope,
        underlay: Option<Arc<dyn TunnelServer>>,
    ) -> Result<Arc<dyn TunnelServer>, TunnelError> {
        match self {
            TunnelKind::Transport => {
                Ok(Arc::new(transport::TransportServer::new(scope).await?))
            }
            TunnelKind::Tls => Ok(Arc::new(
                tls::TlsServer::new(scope, require_underlay(self, underlay)?).await?,
            )),
            TunnelKind::Websocket => Ok(Arc::new(websocket::WebsocketServer::new(
                scope,
                require_underlay(self, underlay)?,
            )?)),
            TunnelKind::Trojan => Ok(Arc::new(
                trojan::TrojanServer::new(scope, require_underlay(self, underlay)?).await?,
            )),
            TunnelKind::Mux => Ok(Arc::new(mux::MuxServer::new(
                scope,
                require_underlay(self, underlay)?,
            ))),
            TunnelKind::Freedom => Err(TunnelError::Config(
                "FREEDOM has no server side".to_string(),
            )),
        }
    }

    /// Construct the client side of this layer on top of `underlay`.
    pub async fn new_client(
        self,
        scope: &Scope,
        underlay: Option<Arc<dyn TunnelClient>>,
    ) -> Result<Arc<dyn TunnelClient>, TunnelError> {
        let _ = underlay;
        match self {
            TunnelKind::Freedom => Ok(Arc::new(freedom::FreedomClient::new(scope))),
            other => Err(TunnelError::Config(format!(
                "{} has no client side in this build",
                other.name()
            ))),
        }
    }
}

fn require_underlay(
    kind: TunnelKind,
    underlay: Option<Arc<dyn TunnelServer>>,
) -> Result<Arc<dyn TunnelServer>, TunnelError> {
    underlay.ok_or_else(|| TunnelError::Config(format!("{} requires an underlay", kind.name())))
}

impl StreamConn for tokio::net::TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        tokio::net::TcpStream::peer_addr(self).ok()
    }
}

impl StreamConn for tokio::io::DuplexStream {}

impl StreamConn for Box<dyn StreamConn> {
    fn metadata(&self) -> Option<&Metadata> {
        (**self).metadata()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        (**self).peer_addr()
    }
}

impl<S: StreamConn> StreamConn for RewindConn<S> {
    fn metadata(&self) -> Option<&Metadata> {
        self.get_ref().metadata()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().peer_addr()
    }
}

impl<S: StreamConn> StreamConn for tokio_rustls::server::TlsStream<S> {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::TunnelKind;

    #[test]
    fn registry_round_trips_every_name() {
        for kind in TunnelKind::ALL {
            assert_eq!(TunnelKind::from_name(kind.name()).unwrap(), kind);
        }
        assert!(TunnelKind::from_name("SOCKS").is_err());
    }
}
