//! Datagram framing over an authenticated byte stream.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use async_trait::async_trait;
use mirage_core::defaults::MAX_PACKET_BUFFER_BYTES;
use mirage_proto::{parse_packet, write_packet, Metadata, PacketParse, ProtocolError};

use crate::error::TunnelError;
use crate::{BoxConn, PacketConn};

/// Lifts `ATYP | ADDR | PORT | Length | CRLF | Payload` records out of a
/// stream and frames writes the same way.
///
/// Both directions hold independent locks so a blocked read never starves
/// writes.
pub struct PacketStream {
    reader: Mutex<PacketReader>,
    writer: Mutex<WriteHalf<BoxConn>>,
}

struct PacketReader {
    half: ReadHalf<BoxConn>,
    buf: BytesMut,
}

impl PacketStream {
    pub fn new(conn: BoxConn) -> Self {
        let (read_half, write_half) = tokio::io::split(conn);
        Self {
            reader: Mutex::new(PacketReader {
                half: read_half,
                buf: BytesMut::new(),
            }),
            writer: Mutex::new(write_half),
        }
    }
}

#[async_trait]
impl PacketConn for PacketStream {
    async fn read_with_metadata(&self, buf: &mut [u8]) -> Result<(usize, Metadata), TunnelError> {
        let mut reader = self.reader.lock().await;
        loop {
            match parse_packet(&reader.buf) {
                PacketParse::Complete(dgram) => {
                    if dgram.payload.len() > buf.len() {
                        return Err(TunnelError::Protocol(ProtocolError::PayloadTooLarge));
                    }
                    let n = dgram.payload.len();
                    buf[..n].copy_from_slice(dgram.payload);
                    let metadata = Metadata {
                        command: mirage_proto::Command::Associate,
                        address: dgram.address,
                    };
                    let consumed = dgram.consumed;
                    reader.buf.advance(consumed);
                    return Ok((n, metadata));
                }
                PacketParse::Incomplete(_) => {
                    if reader.buf.len() > MAX_PACKET_BUFFER_BYTES {
                        return Err(TunnelError::Protocol(ProtocolError::PayloadTooLarge));
                    }
                    let reader = &mut *reader;
                    let n = reader.half.read_buf(&mut reader.buf).await?;
                    if n == 0 {
                        return Err(TunnelError::UpstreamClosed);
                    }
                }
                PacketParse::Invalid(err) => return Err(TunnelError::Protocol(err)),
            }
        }
    }

    async fn write_with_metadata(
        &self,
        payload: &[u8],
        metadata: &Metadata,
    ) -> Result<usize, TunnelError> {
        let mut frame = BytesMut::with_capacity(payload.len() + 32);
        write_packet(&mut frame, &metadata.address, payload)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(payload.len())
    }
}
