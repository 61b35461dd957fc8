//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via WSRELAY_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use wsrelay_protocol::WireFormat;

/// Top-level file configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Per-connection limits.
    pub limits: LimitsConfig,
    /// TLS configuration.
    pub tls: TlsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("WSRELAY_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.limits.apply_env_overrides();
        self.tls.apply_env_overrides();
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Wire encoding shared with clients.
    pub wire_format: WireFormat,
    /// Keepalive ping period in seconds (absent = no pings).
    pub ping_interval_secs: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9180".parse().unwrap(),
            wire_format: WireFormat::Json,
            ping_interval_secs: None,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("WSRELAY_BIND_ADDR") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
        if let Ok(fmt) = std::env::var("WSRELAY_WIRE_FORMAT") {
            match fmt.as_str() {
                "json" => self.wire_format = WireFormat::Json,
                "binary" => self.wire_format = WireFormat::Binary,
                _ => {}
            }
        }
        if let Ok(secs) = std::env::var("WSRELAY_PING_INTERVAL_SECS") {
            if let Ok(parsed) = secs.parse() {
                self.ping_interval_secs = Some(parsed);
            }
        }
    }
}

/// Per-connection limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent connections (absent = unlimited).
    pub max_connections: Option<usize>,
    /// Inbound packet queue capacity per connection.
    pub packet_qsize: usize,
    /// Outbound send buffer capacity per connection.
    pub send_qsize: usize,
    /// Maximum concurrently running RPC handler tasks.
    pub rpc_task_limit: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: None,
            packet_qsize: 128,
            send_qsize: 128,
            rpc_task_limit: 1024,
        }
    }
}

impl LimitsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(n) = std::env::var("WSRELAY_MAX_CONNECTIONS") {
            if let Ok(parsed) = n.parse() {
                self.max_connections = Some(parsed);
            }
        }
        if let Ok(n) = std::env::var("WSRELAY_PACKET_QSIZE") {
            if let Ok(parsed) = n.parse() {
                self.packet_qsize = parsed;
            }
        }
        if let Ok(n) = std::env::var("WSRELAY_SEND_QSIZE") {
            if let Ok(parsed) = n.parse() {
                self.send_qsize = parsed;
            }
        }
        if let Ok(n) = std::env::var("WSRELAY_RPC_TASK_LIMIT") {
            if let Ok(parsed) = n.parse() {
                self.rpc_task_limit = parsed;
            }
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Enable TLS (wss://).
    pub enabled: bool,
    /// Path to PEM-encoded certificate chain.
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key.
    pub key_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("WSRELAY_TLS_ENABLED") {
            if let Ok(parsed) = enabled.parse() {
                self.enabled = parsed;
            }
        }
        if let Ok(cert) = std::env::var("WSRELAY_TLS_CERT") {
            self.cert_path = Some(cert.into());
        }
        if let Ok(key) = std::env::var("WSRELAY_TLS_KEY") {
            self.key_path = Some(key.into());
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("cannot parse config file {0}: {1}")]
    Parse(PathBuf, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.network.wire_format, WireFormat::Json);
        assert_eq!(config.limits.packet_qsize, 128);
        assert_eq!(config.limits.send_qsize, 128);
        assert_eq!(config.limits.rpc_task_limit, 1024);
        assert!(config.limits.max_connections.is_none());
        assert!(!config.tls.enabled);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = r#"
network:
  bind_addr: "0.0.0.0:9000"
  wire_format: binary
limits:
  max_connections: 64
  packet_qsize: 16
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.network.bind_addr.port(), 9000);
        assert_eq!(config.network.wire_format, WireFormat::Binary);
        assert_eq!(config.limits.max_connections, Some(64));
        assert_eq!(config.limits.packet_qsize, 16);
        // Unspecified sections keep their defaults.
        assert_eq!(config.limits.send_qsize, 128);
    }
}
