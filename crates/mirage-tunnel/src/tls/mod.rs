//! TLS termination with probe defence.
//!
//! Anything that reaches this layer and does not open with a TLS handshake
//! record is rewound and replayed to the decoy origin, so an active prober
//! sees a plain web server. Handshakes that fail for any other reason are
//! closed without a byte of explanation. Decrypted streams are demuxed one
//! more time: an HTTP request line routes to the WebSocket branch, opaque
//! bytes to the trojan branch.

mod keypair;

pub use keypair::{is_domain_name_matched, load_key_pair, load_key_pair_bytes, SniResolver};

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::server::NoServerSessionStorage;
use rustls::ServerConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use mirage_config::SslConfig;
use mirage_core::defaults::{CHANNEL_CAPACITY, HTTP_PEEK_CAPACITY, TLS_PEEK_CAPACITY};
use mirage_core::RewindConn;
use mirage_proto::{Address, Network};

use crate::context::Scope;
use crate::error::TunnelError;
use crate::http::peek_request_line;
use crate::redirect::Redirector;
use crate::transport::send_or_cancel;
use crate::{BoxConn, TunnelKind, TunnelServer};

/// First byte of a TLS handshake record, and the record-layer major
/// version every real client sends.
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const RECORD_VERSION_MAJOR: u8 = 0x03;

pub struct TlsServer {
    conn_rx: tokio::sync::Mutex<mpsc::Receiver<BoxConn>>,
    ws_rx: tokio::sync::Mutex<mpsc::Receiver<BoxConn>>,
    next_http: Arc<AtomicBool>,
    underlay: Arc<dyn TunnelServer>,
    token: CancellationToken,
}

impl TlsServer {
    pub async fn new(
        scope: &Scope,
        underlay: Arc<dyn TunnelServer>,
    ) -> Result<Self, TunnelError> {
        let config = scope.config();
        let ssl = &config.ssl;

        let fallback = if ssl.fallback_port != 0 {
            let host = if ssl.fallback_host.is_empty() {
                warn!("empty tls fallback address, using the trojan fallback host");
                config.remote_addr.clone()
            } else {
                ssl.fallback_host.clone()
            };
            let address = Address::domain(host, ssl.fallback_port, Network::Tcp);
            ensure_reachable(&address).await?;
            Some(address)
        } else {
            warn!("empty tls fallback port");
            None
        };

        let http_response = if fallback.is_none() && !ssl.plain_http_response.is_empty() {
            let bytes = std::fs::read(&ssl.plain_http_response).map_err(|err| {
                TunnelError::Config(format!(
                    "invalid response file {:?}: {err}",
                    ssl.plain_http_response
                ))
            })?;
            Some(Arc::new(bytes))
        } else {
            None
        };

        let key_pair = load_key_pair(&ssl.cert, &ssl.key, &ssl.key_password)?;
        let resolver = Arc::new(SniResolver::new(ssl.verify_hostname, &ssl.sni, key_pair));
        let server_config = build_server_config(ssl, resolver.clone())?;
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let token = scope.token().child_token();
        let (conn_tx, conn_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (ws_tx, ws_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let next_http = Arc::new(AtomicBool::new(false));

        if ssl.cert_check_rate > 0 {
            tokio::spawn(keypair::reload_loop(
                resolver,
                ssl.cert.clone(),
                ssl.key.clone(),
                ssl.key_password.clone(),
                Duration::from_secs(ssl.cert_check_rate),
                token.clone(),
            ));
        }

        let loop_state = AcceptLoop {
            underlay: underlay.clone(),
            acceptor,
            redirector: Redirector::new(token.clone()),
            fallback,
            http_response,
            conn_tx,
            ws_tx,
            next_http: next_http.clone(),
            token: token.clone(),
        };
        tokio::spawn(loop_state.run());
        debug!("tls server created");

        Ok(Self {
            conn_rx: tokio::sync::Mutex::new(conn_rx),
            ws_rx: tokio::sync::Mutex::new(ws_rx),
            next_http,
            underlay,
            token,
        })
    }
}

#[async_trait]
impl TunnelServer for TlsServer {
    async fn accept_conn(&self, next: Option<TunnelKind>) -> Result<BoxConn, TunnelError> {
        let rx = if next == Some(TunnelKind::Websocket) {
            // Set once and never cleared; the tree is immutable after
            // construction.
            self.next_http.store(true, Ordering::SeqCst);
            debug!("next proto http");
            &self.ws_rx
        } else {
            &self.conn_rx
        };
        let mut rx = rx.lock().await;
        tokio::select! {
            conn = rx.recv() => conn.ok_or(TunnelError::Cancelled),
            _ = self.token.cancelled() => Err(TunnelError::Cancelled),
        }
    }

    fn close(&self) {
        self.token.cancel();
        self.underlay.close();
    }
}

struct AcceptLoop {
    underlay: Arc<dyn TunnelServer>,
    acceptor: TlsAcceptor,
    redirector: Redirector,
    fallback: Option<Address>,
    http_response: Option<Arc<Vec<u8>>>,
    conn_tx: mpsc::Sender<BoxConn>,
    ws_tx: mpsc::Sender<BoxConn>,
    next_http: Arc<AtomicBool>,
    token: CancellationToken,
}

impl AcceptLoop {
    async fn run(self) {
        let state = Arc::new(self);
        loop {
            let conn = tokio::select! {
                _ = state.token.cancelled() => break,
                res = state.underlay.accept_conn(Some(TunnelKind::Tls)) => res,
            };
            match conn {
                Ok(conn) => {
                    let state = state.clone();
                    tokio::spawn(async move { state.handle(conn).await });
                }
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    warn!(error = %err, "tls underlay accept error");
                    continue;
                }
            }
        }
        debug!("tls accept loop exiting");
    }

    async fn handle(&self, conn: BoxConn) {
        let peer = conn.peer_addr();
        let mut rewind = RewindConn::new(conn, TLS_PEEK_CAPACITY);

        match sniff_tls(&mut rewind).await {
            Ok(true) => {}
            Ok(false) => {
                // The critical probe-defence path: replay everything to
                // the decoy origin.
                rewind.rewind();
                warn!(peer = ?peer, "first record does not look like a TLS handshake, redirecting");
                self.divert(rewind).await;
                return;
            }
            Err(err) => {
                debug!(peer = ?peer, error = %err, "failed to sniff inbound stream");
                return;
            }
        }

        rewind.rewind();
        rewind.stop_buffering();
        let tls = match self.acceptor.accept(rewind).await {
            Ok(tls) => tls,
            Err(err) => {
                // Nothing is leaked about what went wrong.
                debug!(peer = ?peer, error = %err, "tls handshake failed");
                return;
            }
        };

        {
            let (_, session) = tls.get_ref();
            trace!(
                peer = ?peer,
                cipher = ?session.negotiated_cipher_suite().map(|s| s.suite()),
                kind = ?session.handshake_kind(),
                alpn = ?session.alpn_protocol(),
                "tls handshake complete"
            );
        }

        // A real HTTP parser look-alike: peek the request line on the
        // decrypted stream and route by protocol.
        let mut rewind = RewindConn::new(Box::new(tls) as BoxConn, HTTP_PEEK_CAPACITY);
        let is_http = match peek_request_line(&mut rewind).await {
            Ok(found) => found,
            Err(err) => {
                debug!(peer = ?peer, error = %err, "post-handshake peek failed");
                return;
            }
        };
        rewind.rewind();
        rewind.stop_buffering();
        let conn: BoxConn = Box::new(rewind);

        if !is_http {
            // Opaque payload: trojan protocol layer inspects it further.
            send_or_cancel(&self.conn_tx, conn, &self.token).await;
        } else if self.next_http.load(Ordering::SeqCst) {
            send_or_cancel(&self.ws_tx, conn, &self.token).await;
        } else {
            warn!(peer = ?peer, "incoming http request, but no websocket server is listening");
            if let Some(fallback) = &self.fallback {
                self.redirector.redirect(conn, fallback.clone());
            }
        }
    }

    /// Handshake-failure fallback: redirect, or answer with the canned
    /// plaintext response, or just hang up.
    async fn divert(&self, rewind: RewindConn<BoxConn>) {
        match (&self.fallback, &self.http_response) {
            (Some(fallback), _) => {
                self.redirector.redirect(Box::new(rewind), fallback.clone());
            }
            (None, Some(response)) => {
                let mut conn = rewind;
                if let Err(err) = conn.write_all(response).await {
                    debug!(error = %err, "failed to write plain http response");
                }
                let _ = conn.shutdown().await;
            }
            (None, None) => {}
        }
    }
}

/// Does the stream open like a TLS handshake record?
async fn sniff_tls(conn: &mut RewindConn<BoxConn>) -> std::io::Result<bool> {
    let mut chunk = [0u8; 3];
    while conn.buffered().len() < 3 {
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Ok(false);
        }
        let seen = conn.buffered();
        // Fail fast on the first byte; most probes are plain HTTP.
        if seen[0] != CONTENT_TYPE_HANDSHAKE {
            return Ok(false);
        }
    }
    let seen = conn.buffered();
    Ok(seen[0] == CONTENT_TYPE_HANDSHAKE && seen[1] == RECORD_VERSION_MAJOR)
}

fn build_server_config(
    ssl: &SslConfig,
    resolver: Arc<SniResolver>,
) -> Result<ServerConfig, TunnelError> {
    let provider = build_provider(ssl)?;
    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|err| TunnelError::Config(format!("tls protocol versions: {err}")))?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.alpn_protocols = ssl.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    config.ignore_client_order = ssl.prefer_server_cipher;
    if !ssl.reuse_session {
        config.session_storage = Arc::new(NoServerSessionStorage {});
        config.send_tls13_tickets = 0;
    }
    if !ssl.key_log.is_empty() {
        warn!("tls key logging activated. USE OF KEY LOGGING COMPROMISES SECURITY.");
        config.key_log = Arc::new(FileKeyLog::open(&ssl.key_log)?);
    }
    Ok(config)
}

fn build_provider(ssl: &SslConfig) -> Result<rustls::crypto::CryptoProvider, TunnelError> {
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();

    if !ssl.cipher.is_empty() {
        let wanted: Vec<&str> = ssl.cipher.split(':').filter(|s| !s.is_empty()).collect();
        provider
            .cipher_suites
            .retain(|suite| wanted.iter().any(|w| format!("{:?}", suite.suite()) == *w));
        if provider.cipher_suites.is_empty() {
            return Err(TunnelError::Config(format!(
                "no usable cipher suites in {:?}",
                ssl.cipher
            )));
        }
    }

    if !ssl.curves.is_empty() {
        let wanted: Vec<rustls::NamedGroup> = ssl
            .curves
            .split(':')
            .filter_map(|name| match name {
                "X25519" => Some(rustls::NamedGroup::X25519),
                "P-256" => Some(rustls::NamedGroup::secp256r1),
                "P-384" => Some(rustls::NamedGroup::secp384r1),
                "P-521" => Some(rustls::NamedGroup::secp521r1),
                other => {
                    warn!(curve = other, "ignoring unknown curve");
                    None
                }
            })
            .collect();
        if !wanted.is_empty() {
            provider.kx_groups.retain(|g| wanted.contains(&g.name()));
            if provider.kx_groups.is_empty() {
                return Err(TunnelError::Config(format!(
                    "no usable curves in {:?}",
                    ssl.curves
                )));
            }
        }
    }

    Ok(provider)
}

/// Appends NSS key-log lines to the configured file.
struct FileKeyLog {
    file: Mutex<std::fs::File>,
}

impl std::fmt::Debug for FileKeyLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKeyLog").finish_non_exhaustive()
    }
}

impl FileKeyLog {
    fn open(path: &str) -> Result<Self, TunnelError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| TunnelError::Config(format!("cannot open key log {path:?}: {err}")))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl rustls::KeyLog for FileKeyLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let mut file = self.file.lock();
        let _ = writeln!(
            file,
            "{label} {} {}",
            hex::encode(client_random),
            hex::encode(secret)
        );
    }
}

/// Dial the address once to confirm it is actually serving.
pub(crate) async fn ensure_reachable(address: &Address) -> Result<(), TunnelError> {
    match tokio::net::TcpStream::connect(address.to_string()).await {
        Ok(_) => {
            info!(address = %address, "fallback origin verified");
            Ok(())
        }
        Err(err) => Err(TunnelError::Config(format!(
            "invalid fallback address {address}: {err}"
        ))),
    }
}
