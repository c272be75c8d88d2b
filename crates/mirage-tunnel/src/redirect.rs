//! Redirection of suspect connections to the decoy origin.
//!
//! This is the only behaviour a probing adversary ever observes. The
//! caller rewinds its look-ahead buffer before handing the connection
//! over, so the origin receives, in order, exactly the bytes the client
//! sent.

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mirage_core::relay_stream;
use mirage_proto::Address;

use crate::error::TunnelError;
use crate::BoxConn;

/// Spools rejected inbound connections to a fallback origin.
#[derive(Clone)]
pub struct Redirector {
    token: CancellationToken,
}

impl Redirector {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Detach a task that dials `target` and splices it with `inbound`.
    ///
    /// Best effort: a failed dial closes the inbound connection and the
    /// client sees an ordinary connection reset, nothing more.
    pub fn redirect(&self, inbound: BoxConn, target: Address) {
        let token = self.token.clone();
        tokio::spawn(async move {
            let peer = inbound.peer_addr();
            match TcpStream::connect(target.to_string()).await {
                Ok(outbound) => {
                    debug!(peer = ?peer, target = %target, "redirecting connection");
                    if let Err(err) = relay_stream(inbound, outbound, &token).await {
                        debug!(peer = ?peer, error = %err, "redirect splice ended");
                    }
                }
                Err(err) => {
                    let err = TunnelError::FallbackUnavailable(err.to_string());
                    warn!(target = %target, error = %err, "dropping rejected connection");
                }
            }
        });
    }
}
