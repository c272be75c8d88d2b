//! Configuration validation, run once before the server starts.

use crate::loader::ConfigError;
use crate::Config;

fn fail(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

/// Reject documents the server cannot honour. Everything caught here is a
/// fatal startup error; nothing is validated lazily at accept time.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    match config.run_type.as_str() {
        "server" => {}
        "client" => {
            return Err(fail(
                "run_type \"client\" is not supported by this build; deploy a client-side inbound separately",
            ))
        }
        other => return Err(fail(format!("unknown run_type {other:?}"))),
    }

    if config.password.is_empty() {
        return Err(fail("at least one password is required"));
    }
    if config.password.iter().any(|p| p.is_empty()) {
        return Err(fail("empty passwords are not allowed"));
    }
    if config.local_addr.is_empty() {
        return Err(fail("local_addr must be set"));
    }
    if config.remote_addr.is_empty() || config.remote_port == 0 {
        return Err(fail("remote_addr/remote_port must point at the fallback web origin"));
    }
    if config.log_level > 5 {
        return Err(fail("log_level must be within 0-5"));
    }

    if !config.transport_plugin.enabled {
        if config.ssl.cert.is_empty() || config.ssl.key.is_empty() {
            return Err(fail("ssl.cert and ssl.key are required"));
        }
    }

    if config.websocket.enabled && !config.websocket.path.starts_with('/') {
        return Err(fail("websocket.path must start with \"/\""));
    }

    if config.shadowsocks.enabled {
        return Err(fail("the shadowsocks layer is not bundled with this build"));
    }

    if config.transport_plugin.enabled {
        match config.transport_plugin.plugin_type.as_str() {
            "shadowsocks" | "other" => {
                if config.transport_plugin.command.is_empty() {
                    return Err(fail("transport_plugin.command must be set"));
                }
            }
            "plaintext" => {}
            other => return Err(fail(format!("invalid transport_plugin type {other:?}"))),
        }
    }

    Ok(())
}
