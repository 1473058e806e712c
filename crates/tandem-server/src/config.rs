//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so the server starts with zero
//! configuration for local development.

use std::net::SocketAddr;

use tandem_shared::constants::{APP_NAME, DEFAULT_HTTP_PORT};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP and WebSocket listener.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:5001`
    pub http_addr: SocketAddr,

    /// Human-readable name reported by `/health`.
    /// Env: `INSTANCE_NAME`
    pub instance_name: String,

    /// Maximum number of concurrently connected users (0 = unlimited).
    /// Env: `MAX_PEERS`
    pub max_peers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            instance_name: format!("{APP_NAME} Node"),
            max_peers: 0,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME").filter(|n| !n.is_empty()) {
            config.instance_name = name;
        }

        if let Some(val) = lookup("MAX_PEERS") {
            match val.parse::<usize>() {
                Ok(n) => config.max_peers = n,
                Err(_) => tracing::warn!(value = %val, "Invalid MAX_PEERS, using default"),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::from_lookup(|_| None);
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 5001).into());
        assert_eq!(config.max_peers, 0);
        assert_eq!(config.instance_name, "Tandem Node");
    }

    #[test]
    fn test_env_overrides() {
        let config = ServerConfig::from_lookup(|key| match key {
            "HTTP_ADDR" => Some("127.0.0.1:9000".into()),
            "MAX_PEERS" => Some("50".into()),
            _ => None,
        });
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.max_peers, 50);
    }

    #[test]
    fn test_invalid_addr_keeps_default() {
        let config = ServerConfig::from_lookup(|key| match key {
            "HTTP_ADDR" => Some("not-an-addr".into()),
            "MAX_PEERS" => Some("many".into()),
            _ => None,
        });
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 5001).into());
        assert_eq!(config.max_peers, 0);
    }
}
