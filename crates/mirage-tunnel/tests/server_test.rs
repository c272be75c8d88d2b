//! End-to-end tests for the assembled server pipeline.
//!
//! Each test boots the full tree (transport → tls → {trojan, websocket})
//! on a loopback port with generated certificates, a TCP echo origin as
//! the fallback and another echo server as the relay target.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig};
use tokio_rustls::TlsConnector;

use mirage_auth::{sha224_hex, Authenticator, MemoryAuthenticator};
use mirage_config::{load_str, Config, StdinFormat};
use mirage_proto::{write_request, Address, Command, Host, Metadata, Network, HASH_LEN};
use mirage_tunnel::{build_server_proxy, Proxy, Scope};

const PASSWORD: &str = "correct horse battery staple";

// ============================================================================
// Helpers
// ============================================================================

fn generate_certs(dir: &std::path::Path) -> (String, String) {
    let names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(names).unwrap();

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
    (
        cert_path.to_str().unwrap().to_string(),
        key_path.to_str().unwrap().to_string(),
    )
}

/// TCP server that echoes every byte back, used both as the decoy origin
/// (so replays are observable) and as the relay target.
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn server_config(
    port: u16,
    fallback: SocketAddr,
    cert: &str,
    key: &str,
    cert_check_rate: u64,
) -> Config {
    let doc = serde_json::json!({
        "run_type": "server",
        "local_addr": "127.0.0.1",
        "local_port": port,
        "remote_addr": "127.0.0.1",
        "remote_port": fallback.port(),
        "password": [PASSWORD],
        "log_level": 5,
        "ssl": {
            "cert": cert,
            "key": key,
            "sni": "localhost",
            "fallback_host": "127.0.0.1",
            "fallback_port": fallback.port(),
            "cert_check_rate": cert_check_rate,
        },
        "websocket": {
            "enabled": true,
            "host": "localhost",
            "path": "/ws",
        },
        "mux": {"enabled": true},
    });
    load_str(&doc.to_string(), StdinFormat::Json).unwrap()
}

struct TestServer {
    scope: Scope,
    proxy: Arc<Proxy>,
    port: u16,
    auth: Arc<MemoryAuthenticator>,
}

impl TestServer {
    async fn start(config: Config) -> Self {
        let port = config.local_port;
        let auth = Arc::new(MemoryAuthenticator::from_passwords([PASSWORD]));
        let scope = Scope::new(Arc::new(config), auth.clone());
        let proxy = Arc::new(build_server_proxy(scope.clone()).await.unwrap());
        {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.run().await });
        }
        // Give the accept loops a beat to start.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Self {
            scope,
            proxy,
            port,
            auth,
        }
    }

    async fn start_default(fallback: SocketAddr) -> (Self, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = generate_certs(dir.path());
        let config = server_config(free_port(), fallback, &cert, &key, 0);
        (Self::start(config).await, dir)
    }

    fn stop(&self) {
        self.proxy.close();
    }
}

#[derive(Debug)]
struct AcceptAll;

impl rustls::client::danger::ServerCertVerifier for AcceptAll {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

async fn tls_connect(port: u16) -> tokio_rustls::client::TlsStream<TcpStream> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAll))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    tcp.set_nodelay(true).unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    connector.connect(name, tcp).await.unwrap()
}

fn trojan_request(command: Command, address: Address) -> BytesMut {
    let mut buf = BytesMut::new();
    write_request(
        &mut buf,
        sha224_hex(PASSWORD).as_bytes(),
        &Metadata { command, address },
    )
    .unwrap();
    buf
}

// ============================================================================
// Scenarios
// ============================================================================

/// Happy path: authenticated CONNECT is relayed byte-exactly and the
/// user's traffic counters grow.
#[tokio::test]
async fn connect_relays_to_the_target() {
    let fallback = echo_server().await;
    let target = echo_server().await;
    let (server, _certs) = TestServer::start_default(fallback).await;

    let mut stream = tls_connect(server.port).await;
    let mut request = trojan_request(
        Command::Connect,
        Address::from_socket(target, Network::Tcp),
    );
    request.extend_from_slice(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 37];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..], b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");

    stream.write_all(b"more data").await.unwrap();
    let mut reply = [0u8; 9];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"more data");

    drop(stream);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let user = server
        .auth
        .auth_user(&sha224_hex(PASSWORD))
        .await
        .unwrap();
    assert!(user.recv() >= 46, "client->server bytes counted");
    assert!(user.sent() >= 46, "server->client bytes counted");

    server.stop();
}

/// S2: a bad hash is replayed to the decoy origin byte-for-byte.
#[tokio::test]
async fn bad_hash_replays_to_the_fallback() {
    let fallback = echo_server().await;
    let (server, _certs) = TestServer::start_default(fallback).await;

    let mut stream = tls_connect(server.port).await;
    let mut probe = vec![b'x'; HASH_LEN];
    probe.extend_from_slice(b"\r\nsome junk payload");
    stream.write_all(&probe).await.unwrap();

    // The echo origin sends back exactly what the server replayed.
    let mut reply = vec![0u8; probe.len()];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, probe);

    server.stop();
}

/// S3: a plaintext probe on the TLS port sees only the decoy origin.
#[tokio::test]
async fn non_tls_probe_is_redirected_verbatim() {
    let fallback = echo_server().await;
    let (server, _certs) = TestServer::start_default(fallback).await;

    let mut probe = TcpStream::connect(("127.0.0.1", server.port)).await.unwrap();
    let payload = b"GET / HTTP/1.0\r\nHost: probe\r\n\r\n";
    probe.write_all(payload).await.unwrap();

    let mut reply = vec![0u8; payload.len()];
    probe.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, payload);

    server.stop();
}

/// S4: an HTTP request inside TLS that is not a valid upgrade for the
/// configured path carries the full decrypted request to the fallback.
#[tokio::test]
async fn websocket_path_mismatch_falls_back() {
    let fallback = echo_server().await;
    let (server, _certs) = TestServer::start_default(fallback).await;

    let mut stream = tls_connect(server.port).await;
    let request = b"GET /wrongpath HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
    stream.write_all(request).await.unwrap();

    let mut reply = vec![0u8; request.len()];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..], &request[..]);

    server.stop();
}

/// Trojan over a real WebSocket upgrade on the configured path.
#[tokio::test]
async fn websocket_branch_carries_trojan() {
    let fallback = echo_server().await;
    let target = echo_server().await;
    let (server, _certs) = TestServer::start_default(fallback).await;

    let tls = tls_connect(server.port).await;
    let (ws, _resp) = tokio_tungstenite::client_async("ws://localhost/ws", tls)
        .await
        .unwrap();
    let mut stream = mirage_core::transport::WsStream::new(ws);

    let mut request = trojan_request(
        Command::Connect,
        Address::from_socket(target, Network::Tcp),
    );
    request.extend_from_slice(b"ping over ws");
    stream.write_all(&request).await.unwrap();
    stream.flush().await.unwrap();

    let mut reply = [0u8; 12];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ping over ws");

    server.stop();
}

/// S5: UDP associate forwards datagrams and frames the replies.
#[tokio::test]
async fn udp_associate_round_trip() {
    let fallback = echo_server().await;
    let udp_target = udp_echo_server().await;
    let (server, _certs) = TestServer::start_default(fallback).await;

    let mut stream = tls_connect(server.port).await;
    let associate_addr = Address::from_socket(udp_target, Network::Udp);
    let mut request = trojan_request(Command::Associate, associate_addr.clone());

    let payload = vec![0xAB_u8; 100];
    mirage_proto::write_packet(&mut request, &associate_addr, &payload).unwrap();
    stream.write_all(&request).await.unwrap();

    // Read back one framed datagram: the reply must parse and carry the
    // echoed payload.
    let mut collected = BytesMut::new();
    let mut chunk = [0u8; 1024];
    let datagram = loop {
        match mirage_proto::parse_packet(&collected) {
            mirage_proto::PacketParse::Complete(d) => {
                break (d.payload.to_vec(), d.address.clone());
            }
            mirage_proto::PacketParse::Incomplete(_) => {
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "server closed before replying");
                collected.extend_from_slice(&chunk[..n]);
            }
            mirage_proto::PacketParse::Invalid(err) => panic!("bad frame: {err}"),
        }
    };
    assert_eq!(datagram.0, payload);

    server.stop();
}

/// S6: replacing the key pair on disk is picked up by new handshakes.
#[tokio::test]
async fn certificate_hot_reload_serves_the_new_leaf() {
    let fallback = echo_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = generate_certs(dir.path());
    let config = server_config(free_port(), fallback, &cert, &key, 1);
    let server = TestServer::start(config).await;

    let leaf_before = {
        let stream = tls_connect(server.port).await;
        let (_, session) = stream.get_ref();
        session.peer_certificates().unwrap()[0].clone().into_owned()
    };

    // Overwrite both files with a fresh self-signed pair.
    generate_certs(dir.path());
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let leaf_after = {
        let stream = tls_connect(server.port).await;
        let (_, session) = stream.get_ref();
        session.peer_certificates().unwrap()[0].clone().into_owned()
    };
    assert_ne!(leaf_before.as_ref(), leaf_after.as_ref());

    server.stop();
}

/// Cancelling the scope stops the engine promptly and the listener stops
/// accepting.
#[tokio::test]
async fn shutdown_terminates_the_pipeline() {
    let fallback = echo_server().await;
    let (server, _certs) = TestServer::start_default(fallback).await;

    let proxy = server.proxy.clone();
    let run = tokio::spawn(async move { proxy.run().await });

    server.scope.cancel();
    tokio::time::timeout(Duration::from_secs(1), run)
        .await
        .expect("run() must return after cancellation")
        .unwrap();

    server.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let refused = TcpStream::connect(("127.0.0.1", server.port)).await;
    assert!(refused.is_err(), "listener must be gone after shutdown");
}

/// Mux carrier: sub-streams inside one authenticated connection reach
/// independent targets.
#[tokio::test]
async fn mux_carrier_relays_sub_streams() {
    use std::future::poll_fn;
    use futures_util::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio_util::compat::TokioAsyncReadCompatExt;

    let fallback = echo_server().await;
    let target = echo_server().await;
    let (server, _certs) = TestServer::start_default(fallback).await;

    let mut stream = tls_connect(server.port).await;
    let request = trojan_request(
        Command::Connect,
        Address::domain("MUX_CONN", 0, Network::Tcp),
    );
    stream.write_all(&request).await.unwrap();

    let mut session = yamux::Connection::new(
        stream.compat(),
        yamux::Config::default(),
        yamux::Mode::Client,
    );
    let mut sub = poll_fn(|cx| session.poll_new_outbound(cx)).await.unwrap();
    let driver = tokio::spawn(async move {
        while let Some(res) = poll_fn(|cx| session.poll_next_inbound(cx)).await {
            if res.is_err() {
                break;
            }
        }
    });

    let mut inner = BytesMut::new();
    Metadata {
        command: Command::Connect,
        address: Address::new(
            Host::Ipv4(match target.ip() {
                std::net::IpAddr::V4(ip) => ip,
                _ => unreachable!(),
            }),
            target.port(),
            Network::Tcp,
        ),
    }
    .write_to(&mut inner)
    .unwrap();
    inner.extend_from_slice(b"hello mux");
    sub.write_all(&inner).await.unwrap();
    sub.flush().await.unwrap();

    let mut reply = [0u8; 9];
    sub.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"hello mux");

    driver.abort();
    server.stop();
}
