//! Configuration document loading.

use std::io::Read;
use std::path::Path;

use clap::ValueEnum;

use crate::Config;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("validation: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum StdinFormat {
    #[default]
    Json,
    Yaml,
}

/// Load a config document from a file; the format follows the extension,
/// defaulting to JSON.
pub fn load_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)?;
    let format = match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => StdinFormat::Yaml,
        _ => StdinFormat::Json,
    };
    load_str(&data, format)
}

/// Parse a config document from a string.
pub fn load_str(data: &str, format: StdinFormat) -> Result<Config, ConfigError> {
    let config = match format {
        StdinFormat::Json => serde_json::from_str(data)?,
        StdinFormat::Yaml => serde_yaml::from_str(data)?,
    };
    Ok(config)
}

/// Read a whole config document from standard input.
pub fn load_stdin(format: StdinFormat) -> Result<Config, ConfigError> {
    let mut data = String::new();
    std::io::stdin().read_to_string(&mut data)?;
    load_str(&data, format)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_JSON: &str = r#"{
        "run_type": "server",
        "local_addr": "0.0.0.0",
        "local_port": 443,
        "remote_addr": "127.0.0.1",
        "remote_port": 80,
        "password": ["hunter2"],
        "ssl": {
            "cert": "server.crt",
            "key": "server.key",
            "fallback_host": "127.0.0.1",
            "fallback_port": 80
        }
    }"#;

    #[test]
    fn minimal_json_parses_with_defaults() {
        let config = load_str(MINIMAL_JSON, StdinFormat::Json).unwrap();
        assert_eq!(config.run_type, "server");
        assert_eq!(config.local_port, 443);
        assert_eq!(config.password, vec!["hunter2"]);
        assert_eq!(config.ssl.alpn, vec!["http/1.1"]);
        assert!(config.ssl.reuse_session);
        assert!(config.tcp.no_delay);
        assert!(!config.websocket.enabled);
        assert!(!config.mux.enabled);
        assert_eq!(config.log_level, 1);
    }

    #[test]
    fn yaml_documents_parse_too() {
        let yaml = r#"
run_type: server
local_addr: "::"
local_port: 443
remote_addr: 127.0.0.1
remote_port: 8080
password:
  - hunter2
websocket:
  enabled: true
  host: cdn.example.com
  path: /ws
ssl:
  cert: a.crt
  key: a.key
"#;
        let config = load_str(yaml, StdinFormat::Yaml).unwrap();
        assert!(config.websocket.enabled);
        assert_eq!(config.websocket.path, "/ws");
        assert_eq!(config.remote_port, 8080);
    }

    #[test]
    fn file_extension_selects_the_format() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("config.json");
        std::fs::write(&json_path, MINIMAL_JSON).unwrap();
        assert!(load_file(&json_path).is_ok());

        let yaml_path = dir.path().join("config.yaml");
        std::fs::write(&yaml_path, "run_type: server\n").unwrap();
        // Incomplete document: parse error, not a panic.
        assert!(load_file(&yaml_path).is_err());
    }

    #[test]
    fn log_directive_mapping() {
        let mut config = load_str(MINIMAL_JSON, StdinFormat::Json).unwrap();
        config.log_level = 0;
        assert_eq!(config.log_directive(), "trace");
        config.log_level = 3;
        assert_eq!(config.log_directive(), "error");
        config.log_level = 5;
        assert_eq!(config.log_directive(), "off");
    }
}
