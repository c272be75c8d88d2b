//! Raw TCP transport layer, the root of the pipeline tree.
//!
//! Accepted sockets normally flow straight to the TLS branch. When a
//! transport plugin terminates the obfuscation in front of us the listener
//! rebinds to a loopback port, the plugin subprocess is spawned with the
//! SIP003 environment, and the plaintext-HTTP peek takes over the role the
//! TLS demux plays otherwise.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mirage_core::defaults::{CHANNEL_CAPACITY, REQUEST_PEEK_CAPACITY, TCP_KEEPALIVE_SECS};
use mirage_core::RewindConn;
use mirage_config::TcpConfig;

use crate::context::Scope;
use crate::error::TunnelError;
use crate::http::peek_request_line;
use crate::{BoxConn, TunnelKind, TunnelServer};

pub struct TransportServer {
    conn_rx: tokio::sync::Mutex<mpsc::Receiver<BoxConn>>,
    ws_rx: tokio::sync::Mutex<mpsc::Receiver<BoxConn>>,
    next_http: Arc<AtomicBool>,
    plugin: Mutex<Option<Child>>,
    token: CancellationToken,
}

impl TransportServer {
    pub async fn new(scope: &Scope) -> Result<Self, TunnelError> {
        let config = scope.config();
        let mut listen_host = config.local_addr.clone();
        let mut listen_port = config.local_port;

        let mut plugin = None;
        if config.transport_plugin.enabled {
            warn!("transport plugin enabled, tunnel operates in plain text behind it");
            match config.transport_plugin.plugin_type.as_str() {
                "shadowsocks" => {
                    let inner_host = "127.0.0.1".to_string();
                    let inner_port = pick_loopback_port()?;
                    let mut env = config.transport_plugin.env.clone();
                    env.push(format!("SS_REMOTE_HOST={}", config.local_addr));
                    env.push(format!("SS_REMOTE_PORT={}", config.local_port));
                    env.push(format!("SS_LOCAL_HOST={inner_host}"));
                    env.push(format!("SS_LOCAL_PORT={inner_port}"));
                    env.push(format!(
                        "SS_PLUGIN_OPTIONS={}",
                        config.transport_plugin.option
                    ));
                    debug!(host = %inner_host, port = inner_port, "listener moved behind plugin");
                    plugin = Some(spawn_plugin(
                        &config.transport_plugin.command,
                        &config.transport_plugin.arg,
                        &env,
                    )?);
                    listen_host = inner_host;
                    listen_port = inner_port;
                }
                "other" => {
                    plugin = Some(spawn_plugin(
                        &config.transport_plugin.command,
                        &config.transport_plugin.arg,
                        &config.transport_plugin.env,
                    )?);
                }
                "plaintext" => {}
                other => {
                    return Err(TunnelError::Config(format!(
                        "invalid plugin type {other:?}"
                    )))
                }
            }
        }

        let listener = TcpListener::bind(format_listen(&listen_host, listen_port))
            .await
            .map_err(|err| {
                TunnelError::Config(format!(
                    "cannot listen on {listen_host}:{listen_port}: {err}"
                ))
            })?;
        info!(address = %listener.local_addr()?, "transport listening");

        let (conn_tx, conn_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (ws_tx, ws_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let next_http = Arc::new(AtomicBool::new(false));
        let token = scope.token().child_token();

        tokio::spawn(accept_loop(
            listener,
            conn_tx,
            ws_tx,
            next_http.clone(),
            config.tcp.clone(),
            token.clone(),
        ));

        Ok(Self {
            conn_rx: tokio::sync::Mutex::new(conn_rx),
            ws_rx: tokio::sync::Mutex::new(ws_rx),
            next_http,
            plugin: Mutex::new(plugin),
            token,
        })
    }
}

#[async_trait]
impl TunnelServer for TransportServer {
    async fn accept_conn(&self, next: Option<TunnelKind>) -> Result<BoxConn, TunnelError> {
        let rx = if next == Some(TunnelKind::Websocket) {
            // A WebSocket layer sits directly on TCP: enable the
            // plaintext-HTTP peek for all future connections.
            self.next_http.store(true, Ordering::SeqCst);
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
        if let Some(mut child) = self.plugin.lock().take() {
            if let Err(err) = child.start_kill() {
                warn!(error = %err, "failed to kill transport plugin");
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    conn_tx: mpsc::Sender<BoxConn>,
    ws_tx: mpsc::Sender<BoxConn>,
    next_http: Arc<AtomicBool>,
    tcp: TcpConfig,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            res = listener.accept() => res,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "transport accept error");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        debug!(peer = %peer, "tcp connection");
        apply_tcp_options(&stream, &tcp);

        let conn_tx = conn_tx.clone();
        let ws_tx = ws_tx.clone();
        let next_http = next_http.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let conn: BoxConn = Box::new(stream);
            if next_http.load(Ordering::SeqCst) {
                deliver_plaintext(conn, &conn_tx, &ws_tx, &token).await;
            } else {
                let _ = send_or_cancel(&conn_tx, conn, &token).await;
            }
        });
    }
    debug!("transport accept loop exiting");
}

/// Plaintext mode: mimic a real web server by parsing the request line
/// with the same peek the TLS demux uses, then route by protocol.
async fn deliver_plaintext(
    conn: BoxConn,
    conn_tx: &mpsc::Sender<BoxConn>,
    ws_tx: &mpsc::Sender<BoxConn>,
    token: &CancellationToken,
) {
    let mut rewind = RewindConn::new(conn, REQUEST_PEEK_CAPACITY);
    let is_http = match peek_request_line(&mut rewind).await {
        Ok(found) => found,
        Err(err) => {
            debug!(error = %err, "plaintext peek failed");
            return;
        }
    };
    rewind.rewind();
    rewind.stop_buffering();
    let conn: BoxConn = Box::new(rewind);
    if is_http {
        let _ = send_or_cancel(ws_tx, conn, token).await;
    } else {
        let _ = send_or_cancel(conn_tx, conn, token).await;
    }
}

pub(crate) async fn send_or_cancel<T: Send>(
    tx: &mpsc::Sender<T>,
    value: T,
    token: &CancellationToken,
) -> bool {
    tokio::select! {
        res = tx.send(value) => res.is_ok(),
        _ = token.cancelled() => false,
    }
}

fn apply_tcp_options(stream: &TcpStream, tcp: &TcpConfig) {
    if tcp.no_delay {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, "failed to set TCP_NODELAY");
        }
    }
    if tcp.keep_alive {
        let sock = socket2::SockRef::from(stream);
        let keepalive =
            socket2::TcpKeepalive::new().with_time(Duration::from_secs(TCP_KEEPALIVE_SECS));
        if let Err(err) = sock.set_tcp_keepalive(&keepalive) {
            debug!(error = %err, "failed to set keepalive");
        }
    }
}

fn spawn_plugin(command: &str, args: &[String], env: &[String]) -> Result<Child, TunnelError> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    for entry in env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
    info!(command, "starting transport plugin");
    cmd.spawn()
        .map_err(|err| TunnelError::Config(format!("cannot start plugin {command:?}: {err}")))
}

/// Pick a free loopback port by binding and immediately releasing it.
fn pick_loopback_port() -> Result<u16, TunnelError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

fn format_listen(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
