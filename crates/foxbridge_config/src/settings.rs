use std::path::PathBuf;

use serde::Deserialize;

/// Top-level configuration for the foxbridge server.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Network and identity settings for the WebSocket server.
    pub server: ServerSettings,
    /// TLS settings for the listener. Disabled by default.
    pub tls: TlsSettings,
}

/// Configuration settings for the server.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    /// Display name reported to clients in the `serverInfo` message.
    pub name: String,
    /// The host address (e.g., "127.0.0.1" or "0.0.0.0") the server will bind to.
    pub host: String,
    /// The port number the server will listen on.
    pub port: u16,
    /// Advisory cap on bytes queued toward one client before data frames are
    /// shed. 0 disables the cap.
    pub send_buffer_limit_bytes: usize,
}

/// TLS material for the listener. When `enabled` is true, `cert_file` and
/// `key_file` must both point at PEM files.
#[derive(Debug, Deserialize, Clone)]
pub struct TlsSettings {
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// Partial configuration loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub tls: Option<PartialTlsSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub send_buffer_limit_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialTlsSettings {
    pub enabled: Option<bool>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                name: "foxbridge".to_string(),
                host: "127.0.0.1".to_string(),
                port: 8765,
                send_buffer_limit_bytes: 10_000_000,
            },
            tls: TlsSettings {
                enabled: false,
                cert_file: None,
                key_file: None,
            },
        }
    }
}

impl Settings {
    /// Merge partially specified settings over the defaults.
    pub fn from_partial(partial: PartialSettings) -> Self {
        let default = Settings::default();
        Settings {
            server: ServerSettings {
                name: partial
                    .server
                    .as_ref()
                    .and_then(|s| s.name.clone())
                    .unwrap_or(default.server.name),
                host: partial
                    .server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(default.server.host),
                port: partial
                    .server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(default.server.port),
                send_buffer_limit_bytes: partial
                    .server
                    .as_ref()
                    .and_then(|s| s.send_buffer_limit_bytes)
                    .unwrap_or(default.server.send_buffer_limit_bytes),
            },
            tls: TlsSettings {
                enabled: partial
                    .tls
                    .as_ref()
                    .and_then(|t| t.enabled)
                    .unwrap_or(default.tls.enabled),
                cert_file: partial
                    .tls
                    .as_ref()
                    .and_then(|t| t.cert_file.clone())
                    .or(default.tls.cert_file),
                key_file: partial
                    .tls
                    .as_ref()
                    .and_then(|t| t.key_file.clone())
                    .or(default.tls.key_file),
            },
        }
    }
}
