// ingest-core/src/config.rs
// Configuration management

use serde::{Deserialize, Serialize};
use std::env;
use tracing::warn;

/// Server configuration.
///
/// Loaded from an optional TOML file, with environment variables taking
/// precedence over file values and built-in defaults:
/// `BUS_URL`, `COLUMNAR_ADDR`, `DATABASE_URL`, `GRPC_PORT`,
/// `TLS_ENABLED`, `TLS_CERT_FILE`, `TLS_KEY_FILE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event bus endpoint
    pub bus_url: String,
    /// Columnar store HTTP address
    pub columnar_addr: String,
    /// Agent registry URL; when absent the gateway runs without a registry
    pub database_url: Option<String>,
    /// TCP port for the agent-facing RPC endpoint
    pub grpc_port: u16,
    pub tls: TlsConfig,
    /// Interval handed to agents in the auth response
    pub heartbeat_interval_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: String,
    pub key_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus_url: "nats://localhost:4222".to_string(),
            columnar_addr: "http://localhost:8123".to_string(),
            database_url: None,
            grpc_port: 9002,
            tls: TlsConfig::default(),
            heartbeat_interval_secs: 30,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_file: "server.crt".to_string(),
            key_file: "server.key".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file is missing or malformed, then apply environment overrides.
    pub fn load(path: &str) -> Self {
        let base = match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(err) => {
                    warn!("failed to parse config file {path}: {err}, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };
        base.apply_env()
    }

    /// Configuration from environment variables alone.
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    fn apply_env(mut self) -> Self {
        if let Ok(v) = env::var("BUS_URL") {
            self.bus_url = v;
        }
        if let Ok(v) = env::var("COLUMNAR_ADDR") {
            self.columnar_addr = v;
        }
        if let Ok(v) = env::var("DATABASE_URL") {
            if !v.is_empty() {
                self.database_url = Some(v);
            }
        }
        if let Ok(v) = env::var("GRPC_PORT") {
            match v.parse() {
                Ok(port) => self.grpc_port = port,
                Err(_) => warn!("ignoring unparseable GRPC_PORT {v:?}"),
            }
        }
        if let Ok(v) = env::var("TLS_ENABLED") {
            self.tls.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = env::var("TLS_CERT_FILE") {
            self.tls.cert_file = v;
        }
        if let Ok(v) = env::var("TLS_KEY_FILE") {
            self.tls.key_file = v;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_expectations() {
        let config = Config::default();
        assert_eq!(config.bus_url, "nats://localhost:4222");
        assert_eq!(config.grpc_port, 9002);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(!config.tls.enabled);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn partial_toml_keeps_defaults_for_the_rest() {
        let parsed: Config = toml::from_str("grpc_port = 19002\n").unwrap();
        assert_eq!(parsed.grpc_port, 19002);
        assert_eq!(parsed.bus_url, "nats://localhost:4222");
    }
}
