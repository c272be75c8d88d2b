//! Bidirectional stream relay.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Splice two streams until either direction finishes or the token fires.
///
/// The relay ends as soon as the first copy direction returns (EOF or
/// error); both streams are dropped by the caller afterwards. A cancelled
/// token ends the relay cleanly with `Ok(())`.
pub async fn relay_stream<A, B>(a: A, b: B, shutdown: &CancellationToken) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let forward = tokio::io::copy(&mut a_read, &mut b_write);
    let backward = tokio::io::copy(&mut b_read, &mut a_write);
    tokio::pin!(forward, backward);

    tokio::select! {
        res = &mut forward => {
            res?;
        }
        res = &mut backward => {
            res?;
        }
        _ = shutdown.cancelled() => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn relays_both_directions_until_eof() {
        let (client_side, client_inner) = duplex(256);
        let (server_side, server_inner) = duplex(256);
        let token = CancellationToken::new();

        let relay = tokio::spawn({
            let token = token.clone();
            async move { relay_stream(client_inner, server_inner, &token).await }
        });

        let (mut client, mut server) = (client_side, server_side);
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_ends_the_relay() {
        let (_client, client_inner) = duplex(256);
        let (_server, server_inner) = duplex(256);
        let token = CancellationToken::new();

        let relay = tokio::spawn({
            let token = token.clone();
            async move { relay_stream(client_inner, server_inner, &token).await }
        });

        token.cancel();
        relay.await.unwrap().unwrap();
    }
}
