//! Minimal HTTP request sniffing over a rewindable stream.
//!
//! The TLS and transport layers only need to know whether a stream opens
//! with a plausible HTTP request line; the WebSocket layer additionally
//! needs the request head to check the upgrade headers and path. Both
//! peeks leave the consumed bytes in the rewind buffer so the caller can
//! replay them.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use mirage_core::RewindConn;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Grow the rewind buffer until `pattern` shows up in it. `Ok(false)`
/// means the stream ended first; overflowing the rewind capacity surfaces
/// as the usual fatal read error.
async fn peek_until<S>(conn: &mut RewindConn<S>, pattern: &[u8]) -> io::Result<bool>
where
    S: AsyncRead + Send + Unpin,
{
    let mut chunk = [0u8; 256];
    loop {
        if contains(conn.buffered(), pattern) {
            return Ok(true);
        }
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Ok(false);
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Whether `line` could be the first line of an HTTP request:
/// `METHOD SP TARGET SP HTTP/x.y`.
fn is_request_line(line: &str) -> bool {
    let mut parts = line.split(' ');
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");
    let version = parts.next().unwrap_or("");
    parts.next().is_none()
        && !method.is_empty()
        && method.bytes().all(|b| b.is_ascii_uppercase())
        && !target.is_empty()
        && version.starts_with("HTTP/")
}

/// Peek the stream for an HTTP request line without consuming it.
///
/// Trojan traffic never matches: its first line is 56 bytes of hex with no
/// spaces.
pub async fn peek_request_line<S>(conn: &mut RewindConn<S>) -> io::Result<bool>
where
    S: AsyncRead + Send + Unpin,
{
    if !peek_until(conn, b"\r\n").await? {
        return Ok(false);
    }
    let buffered = conn.buffered();
    let line_end = match buffered.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => pos,
        None => return Ok(false),
    };
    match std::str::from_utf8(&buffered[..line_end]) {
        Ok(line) => Ok(is_request_line(line)),
        Err(_) => Ok(false),
    }
}

/// The parsed head of an inbound HTTP request.
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First value of a header, name compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True when the request asks for a WebSocket upgrade.
    pub fn upgrades_to_websocket(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// Path with any query string stripped.
    pub fn path_only(&self) -> &str {
        self.path.split('?').next().unwrap_or("")
    }
}

/// Peek a full HTTP request head (through the blank line). `Ok(None)` when
/// the bytes do not form one.
pub async fn peek_request_head<S>(conn: &mut RewindConn<S>) -> io::Result<Option<RequestHead>>
where
    S: AsyncRead + Send + Unpin,
{
    if !peek_until(conn, HEADER_END).await? {
        return Ok(None);
    }
    let buffered = conn.buffered();
    let head_end = match buffered
        .windows(HEADER_END.len())
        .position(|w| w == HEADER_END)
    {
        Some(pos) => pos,
        None => return Ok(None),
    };
    let head = match std::str::from_utf8(&buffered[..head_end]) {
        Ok(head) => head,
        Err(_) => return Ok(None),
    };

    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    if !is_request_line(request_line) {
        return Ok(None);
    }
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    let headers = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    Ok(Some(RequestHead {
        method,
        path,
        headers,
    }))
}
