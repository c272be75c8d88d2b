//! Certificate key-pair loading, SNI policy and hot reload.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use x509_parser::extensions::{GeneralName, ParsedExtension};

use crate::error::TunnelError;

/// A loaded key pair plus the names extracted from the leaf certificate.
#[derive(Debug)]
pub struct LoadedKeyPair {
    pub certified: Arc<CertifiedKey>,
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
}

/// Load and parse the certificate chain and private key from PEM files.
///
/// A non-empty `password` decrypts a PKCS#8 `ENCRYPTED PRIVATE KEY` block;
/// decryption fails only on an actual mismatch.
pub fn load_key_pair(
    cert_path: &str,
    key_path: &str,
    password: &str,
) -> Result<LoadedKeyPair, TunnelError> {
    let cert_bytes = std::fs::read(cert_path)
        .map_err(|err| TunnelError::Config(format!("cannot read cert {cert_path:?}: {err}")))?;
    let key_bytes = std::fs::read(key_path)
        .map_err(|err| TunnelError::Config(format!("cannot read key {key_path:?}: {err}")))?;
    load_key_pair_bytes(&cert_bytes, &key_bytes, password)
}

pub fn load_key_pair_bytes(
    cert_bytes: &[u8],
    key_bytes: &[u8],
    password: &str,
) -> Result<LoadedKeyPair, TunnelError> {
    let mut reader = std::io::BufReader::new(cert_bytes);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|err| TunnelError::Config(format!("bad certificate file: {err}")))?;
    let leaf = certs
        .first()
        .ok_or_else(|| TunnelError::Config("no certificates found".to_string()))?;
    let (common_name, dns_names) = leaf_names(leaf)?;

    let key = load_private_key(key_bytes, password)?;
    let signing_key = aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|err| TunnelError::Config(format!("unusable private key: {err}")))?;

    Ok(LoadedKeyPair {
        certified: Arc::new(CertifiedKey::new(certs, signing_key)),
        common_name,
        dns_names,
    })
}

fn load_private_key(
    key_bytes: &[u8],
    password: &str,
) -> Result<PrivateKeyDer<'static>, TunnelError> {
    if !password.is_empty() {
        let blocks = pem::parse_many(key_bytes)
            .map_err(|err| TunnelError::Config(format!("bad key file: {err}")))?;
        if let Some(block) = blocks.iter().find(|b| b.tag() == "ENCRYPTED PRIVATE KEY") {
            let info = pkcs8::EncryptedPrivateKeyInfo::try_from(block.contents())
                .map_err(|err| {
                    TunnelError::Config(format!("bad encrypted key block: {err}"))
                })?;
            let document = info
                .decrypt(password)
                .map_err(|err| TunnelError::Config(format!("cannot decrypt key: {err}")))?;
            return Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                document.as_bytes().to_vec(),
            )));
        }
        warn!("key_password set but the key file is not encrypted");
    }

    let mut reader = std::io::BufReader::new(key_bytes);
    match rustls_pemfile::private_key(&mut reader) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(TunnelError::Config("no private key found".to_string())),
        Err(err) => Err(TunnelError::Config(format!("bad key file: {err}"))),
    }
}

/// Common Name and SAN DNS names of the leaf certificate.
fn leaf_names(
    leaf: &CertificateDer<'_>,
) -> Result<(Option<String>, Vec<String>), TunnelError> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|err| TunnelError::Config(format!("cannot parse leaf certificate: {err}")))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);

    let mut dns_names = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::DNSName(dns) = name {
                    dns_names.push((*dns).to_string());
                }
            }
        }
    }
    Ok((common_name, dns_names))
}

/// Wildcard-aware name matching.
///
/// `*.example.com` matches one extra label in front of the suffix and
/// nothing deeper; any other pattern matches exactly.
pub fn is_domain_name_matched(pattern: &str, name: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        let Some(prefix) = name
            .strip_suffix(suffix)
            .and_then(|p| p.strip_suffix('.'))
        else {
            return false;
        };
        !prefix.is_empty() && !prefix.contains('.')
    } else {
        pattern == name
    }
}

struct ResolverState {
    key: Arc<CertifiedKey>,
    patterns: Vec<String>,
}

/// Serves the current key pair to handshakes and enforces the SNI policy.
///
/// The slot is swapped atomically by the reload loop; every handshake
/// takes a read lock for the duration of one resolve call.
pub struct SniResolver {
    verify: bool,
    configured_sni: String,
    state: RwLock<ResolverState>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("verify", &self.verify)
            .finish_non_exhaustive()
    }
}

impl SniResolver {
    pub fn new(verify: bool, configured_sni: &str, key_pair: LoadedKeyPair) -> Self {
        let patterns = Self::patterns_for(configured_sni, &key_pair);
        Self {
            verify,
            configured_sni: configured_sni.to_string(),
            state: RwLock::new(ResolverState {
                key: key_pair.certified,
                patterns,
            }),
        }
    }

    /// Swap in a freshly loaded key pair.
    pub fn install(&self, key_pair: LoadedKeyPair) {
        let patterns = Self::patterns_for(&self.configured_sni, &key_pair);
        let mut state = self.state.write();
        state.key = key_pair.certified;
        state.patterns = patterns;
    }

    /// Current leaf certificate, for tests and diagnostics.
    pub fn current_leaf(&self) -> Option<CertificateDer<'static>> {
        self.state.read().key.cert.first().cloned()
    }

    /// The configured SNI wins; the certificate Common Name is the
    /// fallback. SAN DNS names always count.
    fn patterns_for(configured_sni: &str, key_pair: &LoadedKeyPair) -> Vec<String> {
        let mut patterns = Vec::new();
        if !configured_sni.is_empty() {
            patterns.push(configured_sni.to_string());
        } else if let Some(cn) = &key_pair.common_name {
            patterns.push(cn.clone());
        }
        patterns.extend(key_pair.dns_names.iter().cloned());
        patterns
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let state = self.state.read();
        if self.verify {
            let requested = client_hello.server_name();
            let matched = requested
                .map(|name| {
                    state
                        .patterns
                        .iter()
                        .any(|pattern| is_domain_name_matched(pattern, name))
                })
                .unwrap_or(false);
            if !matched {
                warn!(sni = ?requested, "rejecting handshake: sni mismatch");
                return None;
            }
        }
        Some(state.key.clone())
    }
}

/// Poll the key and certificate files, swapping the slot on change.
///
/// In-flight handshakes keep the pair they resolved; only new handshakes
/// see the new certificate.
pub async fn reload_loop(
    resolver: Arc<SniResolver>,
    cert_path: String,
    key_path: String,
    password: String,
    check_rate: Duration,
    token: CancellationToken,
) {
    let mut last_cert = tokio::fs::read(&cert_path).await.unwrap_or_default();
    let mut last_key = tokio::fs::read(&key_path).await.unwrap_or_default();
    let mut ticker = tokio::time::interval(check_rate);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("certificate poller exiting");
                return;
            }
            _ = ticker.tick() => {}
        }
        debug!("checking certificate files");
        let cert_bytes = match tokio::fs::read(&cert_path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to re-read certificate");
                continue;
            }
        };
        let key_bytes = match tokio::fs::read(&key_path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to re-read key");
                continue;
            }
        };
        if cert_bytes == last_cert && key_bytes == last_key {
            continue;
        }
        match load_key_pair_bytes(&cert_bytes, &key_bytes, &password) {
            Ok(pair) => {
                info!("new key pair detected");
                resolver.install(pair);
                last_cert = cert_bytes;
                last_key = key_bytes;
            }
            Err(err) => warn!(error = %err, "failed to load new key pair"),
        }
    }
}
