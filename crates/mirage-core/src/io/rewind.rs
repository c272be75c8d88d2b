//! Rewindable stream adapter for non-destructive protocol sniffing.
//!
//! Every fallback path in the server works the same way: a layer reads a
//! bounded prefix of an inbound stream through this adapter, decides the
//! bytes are not for it, rewinds, and hands the stream to the redirector.
//! The decoy origin then sees exactly the bytes the client sent, starting
//! at offset zero.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream wrapper with a bounded look-ahead buffer that can be replayed.
///
/// While `buffering` is on, every byte read from the inner stream is also
/// appended to the buffer. `rewind()` repositions the read cursor at the
/// start of the buffer, so subsequent reads replay the captured prefix
/// before touching the inner stream again. `stop_buffering()` freezes the
/// buffer: any unread remainder still drains, but no new bytes are
/// captured.
///
/// Reads that would grow the buffer past its capacity fail; a caller that
/// needs a longer look-ahead has sized the adapter wrong.
pub struct RewindConn<S> {
    inner: S,
    buffer: Vec<u8>,
    capacity: usize,
    index: usize,
    buffering: bool,
}

impl<S> RewindConn<S> {
    /// Wrap `inner` with a look-ahead buffer of at most `capacity` bytes.
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(capacity.min(4096)),
            capacity,
            index: 0,
            buffering: true,
        }
    }

    /// Reposition the read cursor at the start of the captured prefix.
    pub fn rewind(&mut self) {
        self.index = 0;
    }

    /// Freeze the buffer. The unread remainder still drains; further reads
    /// pass through to the inner stream without being captured.
    pub fn stop_buffering(&mut self) {
        self.buffering = false;
    }

    /// Bytes captured so far.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn overflow_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "rewind buffer overflow")
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;

        // Replay any unread captured bytes first.
        if me.index < me.buffer.len() {
            let remaining = &me.buffer[me.index..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            me.index += n;
            return Poll::Ready(Ok(()));
        }

        if !me.buffering {
            // Fully drained and frozen: the buffer is inert from here on.
            if !me.buffer.is_empty() {
                me.buffer.clear();
                me.index = 0;
            }
            return Pin::new(&mut me.inner).poll_read(cx, buf);
        }

        let filled_before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let fresh = &buf.filled()[filled_before..];
                if me.buffer.len() + fresh.len() > me.capacity {
                    return Poll::Ready(Err(overflow_error()));
                }
                me.buffer.extend_from_slice(fresh);
                me.index = me.buffer.len();
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindConn<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn rewind_replays_the_captured_prefix() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"hello trojan").await.unwrap();

        let mut conn = RewindConn::new(server, 64);
        let mut first = [0u8; 5];
        conn.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"hello");

        conn.rewind();
        let mut replay = [0u8; 5];
        conn.read_exact(&mut replay).await.unwrap();
        assert_eq!(&replay, b"hello");

        // Continues transparently into unread stream bytes.
        let mut rest = [0u8; 7];
        conn.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b" trojan");
    }

    #[tokio::test]
    async fn rewind_then_stop_buffering_drains_then_passes_through() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"abcdef").await.unwrap();

        let mut conn = RewindConn::new(server, 64);
        let mut buf = [0u8; 6];
        conn.read_exact(&mut buf).await.unwrap();

        conn.rewind();
        conn.stop_buffering();

        client.write_all(b"ghi").await.unwrap();
        let mut all = [0u8; 9];
        conn.read_exact(&mut all).await.unwrap();
        assert_eq!(&all, b"abcdefghi");
    }

    #[tokio::test]
    async fn overflow_while_buffering_is_a_read_error() {
        let (mut client, server) = duplex(1024);
        client.write_all(&[0u8; 32]).await.unwrap();

        let mut conn = RewindConn::new(server, 8);
        let mut buf = [0u8; 32];
        let err = conn.read_exact(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("rewind buffer overflow"));
    }

    #[tokio::test]
    async fn writes_pass_through() {
        let (mut client, server) = duplex(1024);
        let mut conn = RewindConn::new(server, 8);
        conn.write_all(b"response").await.unwrap();

        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response");
    }

    #[tokio::test]
    async fn frozen_buffer_goes_inert_after_drain() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"xy").await.unwrap();

        let mut conn = RewindConn::new(server, 4);
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        conn.stop_buffering();

        client.write_all(b"zw").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"zw");
        assert!(conn.buffered().is_empty());
    }
}
