//! Trojan wire protocol: addresses, request metadata and datagram framing.
//!
//! The request header travels once per connection, directly after the
//! 56-byte password hash:
//!
//! ```text
//! +-----------------------+---------+----------------+---------+----------+
//! | hex(SHA224(password)) |  CRLF   | Request header |  CRLF   | Payload  |
//! +-----------------------+---------+----------------+---------+----------+
//! |          56           | X'0D0A' |    Variable    | X'0D0A' | Variable |
//! +-----------------------+---------+----------------+---------+----------+
//! ```
//!
//! with `Request header = CMD | ATYP | DST.ADDR | DST.PORT`. UDP payloads
//! reuse the address encoding with a big-endian length and CRLF in front of
//! each datagram.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const HASH_LEN: usize = 56;
pub const CRLF: &[u8; 2] = b"\r\n";

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_ASSOCIATE: u8 = 0x03;
pub const CMD_MUX: u8 = 0x7f;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const MAX_DOMAIN_LEN: usize = 255;

/// Sentinel domain name marking a CONNECT request as a mux carrier.
pub const MUX_SENTINEL: &str = "MUX_CONN";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("missing CRLF in framing")]
    InvalidCrlf,
    #[error("unknown command {0:#04x}")]
    InvalidCommand(u8),
    #[error("unknown address type {0:#04x}")]
    InvalidAtyp(u8),
    #[error("empty domain name")]
    EmptyDomain,
    #[error("domain name is not valid UTF-8")]
    InvalidDomain,
    #[error("domain name longer than {MAX_DOMAIN_LEN} bytes")]
    DomainTooLong,
    #[error("datagram payload exceeds u16 length field")]
    PayloadTooLarge,
    #[error("framing read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Inner command carried by the request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Associate,
    Mux,
}

impl Command {
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            CMD_CONNECT => Ok(Command::Connect),
            CMD_ASSOCIATE => Ok(Command::Associate),
            CMD_MUX => Ok(Command::Mux),
            other => Err(ProtocolError::InvalidCommand(other)),
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            Command::Connect => CMD_CONNECT,
            Command::Associate => CMD_ASSOCIATE,
            Command::Mux => CMD_MUX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

/// Logical destination: host, port and transport network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: Host,
    pub port: u16,
    pub network: Network,
}

impl Address {
    pub fn new(host: Host, port: u16, network: Network) -> Self {
        Self {
            host,
            port,
            network,
        }
    }

    pub fn from_socket(addr: SocketAddr, network: Network) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => Host::Ipv4(ip),
            IpAddr::V6(ip) => Host::Ipv6(ip),
        };
        Self::new(host, addr.port(), network)
    }

    pub fn domain(name: impl Into<String>, port: u16, network: Network) -> Self {
        Self::new(Host::Domain(name.into()), port, network)
    }

    /// True when the host is the given domain name.
    pub fn is_domain(&self, name: &str) -> bool {
        matches!(&self.host, Host::Domain(d) if d == name)
    }

    /// Read `ATYP | DST.ADDR | DST.PORT` from the stream.
    pub async fn read_from<R>(r: &mut R, network: Network) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = r.read_u8().await?;
        let host = match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                r.read_exact(&mut octets).await?;
                Host::Ipv4(Ipv4Addr::from(octets))
            }
            ATYP_DOMAIN => {
                let len = r.read_u8().await? as usize;
                if len == 0 {
                    return Err(ProtocolError::EmptyDomain);
                }
                let mut name = vec![0u8; len];
                r.read_exact(&mut name).await?;
                let name = String::from_utf8(name).map_err(|_| ProtocolError::InvalidDomain)?;
                Host::Domain(name)
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                r.read_exact(&mut octets).await?;
                Host::Ipv6(Ipv6Addr::from(octets))
            }
            other => return Err(ProtocolError::InvalidAtyp(other)),
        };
        let port = r.read_u16().await?;
        Ok(Self::new(host, port, network))
    }

    /// Append `ATYP | DST.ADDR | DST.PORT` to the buffer.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        match &self.host {
            Host::Ipv4(ip) => {
                buf.extend_from_slice(&[ATYP_IPV4]);
                buf.extend_from_slice(&ip.octets());
            }
            Host::Ipv6(ip) => {
                buf.extend_from_slice(&[ATYP_IPV6]);
                buf.extend_from_slice(&ip.octets());
            }
            Host::Domain(name) => {
                if name.len() > MAX_DOMAIN_LEN {
                    return Err(ProtocolError::DomainTooLong);
                }
                buf.extend_from_slice(&[ATYP_DOMAIN, name.len() as u8]);
                buf.extend_from_slice(name.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
        Ok(())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ipv4(ip) => write!(f, "{ip}:{}", self.port),
            Host::Ipv6(ip) => write!(f, "[{ip}]:{}", self.port),
            Host::Domain(name) => write!(f, "{name}:{}", self.port),
        }
    }
}

/// Parsed request header: the command plus the logical destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub command: Command,
    pub address: Address,
}

impl Metadata {
    /// Read `CMD | ATYP | DST.ADDR | DST.PORT` from the stream. The
    /// surrounding CRLFs belong to the caller.
    pub async fn read_from<R>(r: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let command = Command::from_byte(r.read_u8().await?)?;
        let network = match command {
            Command::Associate => Network::Udp,
            _ => Network::Tcp,
        };
        let address = Address::read_from(r, network).await?;
        Ok(Self { command, address })
    }

    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.extend_from_slice(&[self.command.byte()]);
        self.address.write_to(buf)
    }
}

/// Append a full trojan request header (hash through trailing CRLF).
pub fn write_request(
    buf: &mut BytesMut,
    hash_hex: &[u8],
    metadata: &Metadata,
) -> Result<(), ProtocolError> {
    debug_assert_eq!(hash_hex.len(), HASH_LEN);
    buf.extend_from_slice(hash_hex);
    buf.extend_from_slice(CRLF);
    metadata.write_to(buf)?;
    buf.extend_from_slice(CRLF);
    Ok(())
}

/// One parsed datagram lifted out of the stream framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram<'a> {
    pub address: Address,
    pub payload: &'a [u8],
    /// Total framed length, including header and CRLF.
    pub consumed: usize,
}

/// Result of incremental datagram parsing.
///
/// `Incomplete(n)` carries the minimum total bytes needed before a retry
/// can succeed, not the additional bytes.
#[derive(Debug)]
pub enum PacketParse<'a> {
    Complete(Datagram<'a>),
    Incomplete(usize),
    Invalid(ProtocolError),
}

/// Parse `ATYP | DST.ADDR | DST.PORT | Length | CRLF | Payload` from the
/// front of `buf`.
pub fn parse_packet(buf: &[u8]) -> PacketParse<'_> {
    if buf.is_empty() {
        return PacketParse::Incomplete(1);
    }
    let (address, addr_len) = match parse_addr_prefix(buf) {
        Ok(AddrParse::Done(v)) => v,
        Ok(AddrParse::Need(n)) => return PacketParse::Incomplete(n),
        Err(e) => return PacketParse::Invalid(e),
    };

    let mut offset = addr_len;
    if buf.len() < offset + 4 {
        return PacketParse::Incomplete(offset + 4);
    }
    let length = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
    if &buf[offset + 2..offset + 4] != CRLF {
        return PacketParse::Invalid(ProtocolError::InvalidCrlf);
    }
    offset += 4;
    if buf.len() < offset + length {
        return PacketParse::Incomplete(offset + length);
    }

    PacketParse::Complete(Datagram {
        address,
        payload: &buf[offset..offset + length],
        consumed: offset + length,
    })
}

/// Append one framed datagram to the buffer.
pub fn write_packet(
    buf: &mut BytesMut,
    address: &Address,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    if payload.len() > u16::MAX as usize {
        return Err(ProtocolError::PayloadTooLarge);
    }
    address.write_to(buf)?;
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    Ok(())
}

enum AddrParse {
    Done((Address, usize)),
    /// Minimum total buffer length needed to finish the prefix.
    Need(usize),
}

/// Parse the `ATYP | ADDR | PORT` prefix out of a buffer.
fn parse_addr_prefix(buf: &[u8]) -> Result<AddrParse, ProtocolError> {
    let atyp = buf[0];
    match atyp {
        ATYP_IPV4 => {
            if buf.len() < 7 {
                return Ok(AddrParse::Need(7));
            }
            let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
            let port = u16::from_be_bytes([buf[5], buf[6]]);
            Ok(AddrParse::Done((
                Address::new(Host::Ipv4(ip), port, Network::Udp),
                7,
            )))
        }
        ATYP_DOMAIN => {
            if buf.len() < 2 {
                return Ok(AddrParse::Need(2));
            }
            let len = buf[1] as usize;
            if len == 0 {
                return Err(ProtocolError::EmptyDomain);
            }
            let need = 2 + len + 2;
            if buf.len() < need {
                return Ok(AddrParse::Need(need));
            }
            let name = std::str::from_utf8(&buf[2..2 + len])
                .map_err(|_| ProtocolError::InvalidDomain)?;
            let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
            Ok(AddrParse::Done((
                Address::domain(name, port, Network::Udp),
                need,
            )))
        }
        ATYP_IPV6 => {
            if buf.len() < 19 {
                return Ok(AddrParse::Need(19));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[1..17]);
            let port = u16::from_be_bytes([buf[17], buf[18]]);
            Ok(AddrParse::Done((
                Address::new(Host::Ipv6(Ipv6Addr::from(octets)), port, Network::Udp),
                19,
            )))
        }
        other => Err(ProtocolError::InvalidAtyp(other)),
    }
}
