//! Direct outbound dialer, the sink of the server pipeline.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use mirage_proto::{Address, Command, Host, Metadata, Network};

use crate::context::Scope;
use crate::error::TunnelError;
use crate::{BoxConn, BoxPacket, PacketConn, StreamConn, TunnelClient, TunnelKind};

/// Resolve a logical address to one socket address.
pub async fn resolve(address: &Address, prefer_ipv4: bool) -> Result<SocketAddr, TunnelError> {
    match &address.host {
        Host::Ipv4(ip) => Ok(SocketAddr::new((*ip).into(), address.port)),
        Host::Ipv6(ip) => Ok(SocketAddr::new((*ip).into(), address.port)),
        Host::Domain(name) => {
            let mut candidates = tokio::net::lookup_host((name.as_str(), address.port)).await?;
            let picked = if prefer_ipv4 {
                let mut all: Vec<SocketAddr> = candidates.collect();
                all.sort_by_key(|a| !a.is_ipv4());
                all.into_iter().next()
            } else {
                candidates.next()
            };
            picked.ok_or_else(|| {
                TunnelError::Config(format!("no addresses resolved for {name}"))
            })
        }
    }
}

/// Dials targets directly over the host network stack.
pub struct FreedomClient {
    no_delay: bool,
    prefer_ipv4: bool,
    token: CancellationToken,
}

impl FreedomClient {
    pub fn new(scope: &Scope) -> Self {
        let tcp = &scope.config().tcp;
        Self {
            no_delay: tcp.no_delay,
            prefer_ipv4: tcp.prefer_ipv4,
            token: scope.token().child_token(),
        }
    }
}

#[async_trait]
impl TunnelClient for FreedomClient {
    async fn dial_conn(
        &self,
        address: &Address,
        _next: Option<TunnelKind>,
    ) -> Result<BoxConn, TunnelError> {
        let target = resolve(address, self.prefer_ipv4).await?;
        let stream = TcpStream::connect(target).await?;
        if self.no_delay {
            stream.set_nodelay(true)?;
        }
        debug!(target = %address, resolved = %target, "outbound connected");
        Ok(Box::new(FreedomConn {
            inner: stream,
            metadata: Metadata {
                command: Command::Connect,
                address: address.clone(),
            },
        }))
    }

    async fn dial_packet(&self, _next: Option<TunnelKind>) -> Result<BoxPacket, TunnelError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Box::new(FreedomPacket {
            socket,
            prefer_ipv4: self.prefer_ipv4,
        }))
    }

    fn close(&self) {
        self.token.cancel();
    }
}

struct FreedomConn {
    inner: TcpStream,
    metadata: Metadata,
}

impl StreamConn for FreedomConn {
    fn metadata(&self) -> Option<&Metadata> {
        Some(&self.metadata)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr().ok()
    }
}

impl AsyncRead for FreedomConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FreedomConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

struct FreedomPacket {
    socket: UdpSocket,
    prefer_ipv4: bool,
}

#[async_trait]
impl PacketConn for FreedomPacket {
    async fn read_with_metadata(&self, buf: &mut [u8]) -> Result<(usize, Metadata), TunnelError> {
        let (n, from) = self.socket.recv_from(buf).await?;
        Ok((
            n,
            Metadata {
                command: Command::Associate,
                address: Address::from_socket(from, Network::Udp),
            },
        ))
    }

    async fn write_with_metadata(
        &self,
        payload: &[u8],
        metadata: &Metadata,
    ) -> Result<usize, TunnelError> {
        let target = resolve(&metadata.address, self.prefer_ipv4).await?;
        let n = self.socket.send_to(payload, target).await?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn resolve_keeps_literal_addresses() {
        let address = Address::new(Host::Ipv4(Ipv4Addr::LOCALHOST), 443, Network::Tcp);
        let resolved = resolve(&address, false).await.unwrap();
        assert_eq!(resolved, SocketAddr::from(([127, 0, 0, 1], 443)));
    }

    #[tokio::test]
    async fn resolve_handles_localhost_domain() {
        let address = Address::domain("localhost", 80, Network::Tcp);
        let resolved = resolve(&address, true).await.unwrap();
        assert_eq!(resolved.port(), 80);
        assert!(resolved.ip().is_loopback());
    }

    #[tokio::test]
    async fn udp_round_trip_through_packet_conn() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let packet = FreedomPacket {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            prefer_ipv4: false,
        };
        let metadata = Metadata {
            command: Command::Associate,
            address: Address::from_socket(echo_addr, Network::Udp),
        };
        packet.write_with_metadata(b"ping", &metadata).await.unwrap();

        let mut buf = [0u8; 128];
        let (n, reply_meta) = packet.read_with_metadata(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(
            reply_meta.address,
            Address::from_socket(echo_addr, Network::Udp)
        );
    }
}
