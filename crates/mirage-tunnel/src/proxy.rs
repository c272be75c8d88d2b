//! The proxy engine: pipeline tree assembly and the relay loops.
//!
//! Endpoints — leaves of the tunnel tree — produce authenticated
//! connections; the engine bridges each one to the outbound client stack
//! and pumps bytes until either side finishes or the scope is cancelled.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mirage_core::defaults::MAX_PACKET_SIZE;
use mirage_core::relay_stream;

use crate::context::Scope;
use crate::error::TunnelError;
use crate::{BoxConn, BoxPacket, PacketConn, TunnelClient, TunnelKind, TunnelServer};

/// One node of the pipeline tree. Children are built lazily on top of the
/// parent's server and the tree never changes after startup.
pub struct Node {
    pub kind: TunnelKind,
    pub server: Arc<dyn TunnelServer>,
    pub children: HashMap<&'static str, Node>,
    pub is_endpoint: bool,
    scope: Scope,
}

impl Node {
    /// Construct a root node (a layer with no underlay).
    pub async fn root(kind: TunnelKind, scope: &Scope) -> Result<Self, TunnelError> {
        let scope = scope.child();
        let server = kind.new_server(&scope, None).await?;
        Ok(Self {
            kind,
            server,
            children: HashMap::new(),
            is_endpoint: false,
            scope,
        })
    }

    /// Get or build the child of the given kind, stacking its server on
    /// this node's server.
    pub async fn build_next(&mut self, kind: TunnelKind) -> Result<&mut Node, TunnelError> {
        let name = kind.name();
        if !self.children.contains_key(name) {
            let scope = self.scope.child();
            let server = kind.new_server(&scope, Some(self.server.clone())).await?;
            self.children.insert(
                name,
                Node {
                    kind,
                    server,
                    children: HashMap::new(),
                    is_endpoint: false,
                    scope,
                },
            );
        }
        self.children
            .get_mut(name)
            .ok_or_else(|| TunnelError::Config(format!("lost node {name}")))
    }

    /// Walk (building as needed) a path of layers below this node.
    pub async fn build_path(&mut self, path: &[TunnelKind]) -> Result<&mut Node, TunnelError> {
        let mut node = self;
        for kind in path {
            node = node.build_next(*kind).await?;
        }
        Ok(node)
    }
}

/// Collect the servers of every endpoint (marked, or leaf) in the tree.
pub fn find_all_endpoints(root: &Node) -> Vec<Arc<dyn TunnelServer>> {
    let mut list = Vec::new();
    if root.is_endpoint || root.children.is_empty() {
        list.push(root.server.clone());
    }
    for child in root.children.values() {
        list.extend(find_all_endpoints(child));
    }
    list
}

/// Relays connections and packets between inbound endpoints and the
/// outbound client stack.
pub struct Proxy {
    sources: Vec<Arc<dyn TunnelServer>>,
    sink: Arc<dyn TunnelClient>,
    scope: Scope,
}

impl Proxy {
    pub fn new(
        scope: Scope,
        sources: Vec<Arc<dyn TunnelServer>>,
        sink: Arc<dyn TunnelClient>,
    ) -> Self {
        Self {
            sources,
            sink,
            scope,
        }
    }

    /// Start all relay loops and park until the scope is cancelled.
    pub async fn run(&self) {
        for source in &self.sources {
            tokio::spawn(relay_conn_loop(
                source.clone(),
                self.sink.clone(),
                self.scope.token().clone(),
            ));
            tokio::spawn(relay_packet_loop(
                source.clone(),
                self.sink.clone(),
                self.scope.token().clone(),
            ));
        }
        self.scope.cancelled().await;
    }

    pub fn close(&self) {
        self.scope.cancel();
        self.sink.close();
        for source in &self.sources {
            source.close();
        }
    }
}

async fn relay_conn_loop(
    source: Arc<dyn TunnelServer>,
    sink: Arc<dyn TunnelClient>,
    token: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            _ = token.cancelled() => break,
            res = source.accept_conn(None) => res,
        };
        let inbound = match inbound {
            Ok(inbound) => inbound,
            Err(err) => {
                if token.is_cancelled() || err.is_cancelled() {
                    break;
                }
                debug!(error = %err, "failed to accept connection");
                continue;
            }
        };
        let sink = sink.clone();
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(err) = bridge_conn(inbound, sink, token).await {
                debug!(error = %err, "conn relay ended");
            }
        });
    }
    debug!("conn relay loop exiting");
}

async fn bridge_conn(
    inbound: BoxConn,
    sink: Arc<dyn TunnelClient>,
    token: CancellationToken,
) -> Result<(), TunnelError> {
    let Some(metadata) = inbound.metadata().cloned() else {
        warn!("endpoint produced a connection without metadata");
        return Ok(());
    };
    let outbound = match sink.dial_conn(&metadata.address, None).await {
        Ok(outbound) => outbound,
        Err(err) => {
            warn!(target = %metadata.address, error = %err, "proxy failed to dial connection");
            return Ok(());
        }
    };
    relay_stream(inbound, outbound, &token).await?;
    Ok(())
}

async fn relay_packet_loop(
    source: Arc<dyn TunnelServer>,
    sink: Arc<dyn TunnelClient>,
    token: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            _ = token.cancelled() => break,
            res = source.accept_packet(None) => res,
        };
        let inbound = match inbound {
            Ok(inbound) => inbound,
            Err(TunnelError::NotSupported) => {
                // This endpoint never produces datagrams.
                break;
            }
            Err(err) => {
                if token.is_cancelled() || err.is_cancelled() {
                    break;
                }
                debug!(error = %err, "failed to accept packet");
                continue;
            }
        };
        let sink = sink.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let outbound = match sink.dial_packet(None).await {
                Ok(outbound) => outbound,
                Err(err) => {
                    warn!(error = %err, "proxy failed to dial packet");
                    return;
                }
            };
            bridge_packets(inbound, outbound, token).await;
            debug!("packet relay ends");
        });
    }
    debug!("packet relay loop exiting");
}

async fn bridge_packets(inbound: BoxPacket, outbound: BoxPacket, token: CancellationToken) {
    let forward = copy_packets(&*inbound, &*outbound);
    let backward = copy_packets(&*outbound, &*inbound);
    tokio::pin!(forward, backward);
    tokio::select! {
        res = &mut forward => {
            if let Err(err) = res {
                debug!(error = %err, "packet relay error");
            }
        }
        res = &mut backward => {
            if let Err(err) = res {
                debug!(error = %err, "packet relay error");
            }
        }
        _ = token.cancelled() => {}
    }
}

async fn copy_packets(src: &dyn PacketConn, dst: &dyn PacketConn) -> Result<(), TunnelError> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (n, metadata) = src.read_with_metadata(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        dst.write_with_metadata(&buf[..n], &metadata).await?;
    }
}

/// Assemble the server pipeline:
///
/// ```text
/// transport -> tls -> trojan            (endpoint)
///                  -> trojan -> mux     (endpoint)
///                  -> websocket -> trojan            (endpoint)
///                               -> trojan -> mux     (endpoint)
/// ```
///
/// With a transport plugin the TLS layer is skipped and the branches sit
/// directly on the plaintext transport.
pub async fn build_server_proxy(scope: Scope) -> Result<Proxy, TunnelError> {
    let plugin_mode = scope.config().transport_plugin.enabled;

    let mut root = Node::root(TunnelKind::Transport, &scope).await?;
    let base = if plugin_mode {
        &mut root
    } else {
        root.build_next(TunnelKind::Tls).await?
    };

    base.build_path(&[TunnelKind::Trojan, TunnelKind::Mux])
        .await?
        .is_endpoint = true;
    base.build_next(TunnelKind::Trojan).await?.is_endpoint = true;

    base.build_path(&[TunnelKind::Websocket, TunnelKind::Trojan, TunnelKind::Mux])
        .await?
        .is_endpoint = true;
    base.build_path(&[TunnelKind::Websocket, TunnelKind::Trojan])
        .await?
        .is_endpoint = true;

    let sources = find_all_endpoints(&root);
    let sink = TunnelKind::Freedom.new_client(&scope, None).await?;
    Ok(Proxy::new(scope, sources, sink))
}
