//! Configuration model for the mirage server.
//!
//! One document per run, loaded from a file or from standard input. Field
//! names follow the wire-compatible JSON/YAML layout; every section has
//! serde defaults so a minimal server document only names the listener,
//! the fallback origin, passwords and the TLS key pair.

mod cli;
mod loader;
mod validate;

use serde::{Deserialize, Serialize};

pub use cli::Args;
pub use loader::{load_file, load_stdin, load_str, ConfigError, StdinFormat};
pub use validate::validate;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_run_type")]
    pub run_type: String,
    pub local_addr: String,
    pub local_port: u16,
    /// Fallback origin host for rejected trojan traffic.
    pub remote_addr: String,
    pub remote_port: u16,
    pub password: Vec<String>,
    /// 0 = everything … 5 = nothing.
    #[serde(default = "default_log_level")]
    pub log_level: u8,
    #[serde(default)]
    pub log_file: String,
    pub ssl: SslConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub websocket: WebsocketConfig,
    #[serde(default)]
    pub mux: MuxConfig,
    #[serde(default)]
    pub shadowsocks: ShadowsocksConfig,
    #[serde(default)]
    pub transport_plugin: TransportPluginConfig,
    #[serde(default)]
    pub mysql: MysqlConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Tracing filter directive for the configured numeric level.
    pub fn log_directive(&self) -> &'static str {
        match self.log_level {
            0 => "trace",
            1 => "info",
            2 => "warn",
            3 | 4 => "error",
            _ => "off",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    pub cert: String,
    pub key: String,
    #[serde(default)]
    pub key_password: String,
    /// Expected server name; falls back to the certificate Common Name.
    #[serde(default)]
    pub sni: String,
    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,
    /// Reject handshakes whose SNI matches neither the configured name nor
    /// a certificate SAN.
    #[serde(default)]
    pub verify_hostname: bool,
    #[serde(default)]
    pub prefer_server_cipher: bool,
    #[serde(default = "default_true")]
    pub reuse_session: bool,
    /// Colon-separated cipher suite names; empty = library defaults.
    #[serde(default)]
    pub cipher: String,
    /// Colon-separated key exchange curves; empty = library defaults.
    #[serde(default)]
    pub curves: String,
    /// Decoy origin for streams that do not speak TLS. Port 0 disables the
    /// redirect in favour of `plain_http_response`.
    #[serde(default)]
    pub fallback_host: String,
    #[serde(default)]
    pub fallback_port: u16,
    /// File whose bytes are written verbatim to non-TLS probes when no
    /// fallback address is configured.
    #[serde(default)]
    pub plain_http_response: String,
    /// TLS key log destination. Compromises security; debugging only.
    #[serde(default)]
    pub key_log: String,
    /// Seconds between certificate/key file re-reads. 0 disables reload.
    #[serde(default)]
    pub cert_check_rate: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_true")]
    pub no_delay: bool,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    #[serde(default)]
    pub prefer_ipv4: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            no_delay: true,
            keep_alive: true,
            prefer_ipv4: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebsocketConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MuxConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShadowsocksConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportPluginConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `shadowsocks`, `other` or `plaintext`.
    #[serde(default, rename = "type")]
    pub plugin_type: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub arg: Vec<String>,
    /// Extra `KEY=VALUE` pairs for the subprocess environment.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub option: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MysqlConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub server_addr: String,
    #[serde(default)]
    pub server_port: u16,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub check_rate: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_host: String,
    #[serde(default)]
    pub api_port: u16,
}

fn default_run_type() -> String {
    "server".to_string()
}

fn default_log_level() -> u8 {
    1
}

fn default_alpn() -> Vec<String> {
    vec!["http/1.1".to_string()]
}

fn default_true() -> bool {
    true
}
