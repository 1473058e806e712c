//! Client configuration loaded from environment variables.

use std::time::Duration;

use tandem_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_STUN_SERVER, NEGOTIATION_TIMEOUT_SECS};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the rendezvous server.
    /// Env: `TANDEM_SIGNALING_URL`
    pub signaling_url: String,

    /// Base URL of the HTTP API.
    /// Env: `TANDEM_API_URL`
    pub api_url: String,

    /// Env: `TANDEM_NEGOTIATION_TIMEOUT_SECS`
    pub negotiation_timeout: Duration,

    /// Comma separated list of STUN/TURN urls.
    /// Env: `TANDEM_ICE_SERVERS`
    pub ice_servers: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: format!("ws://127.0.0.1:{DEFAULT_HTTP_PORT}/ws"),
            api_url: format!("http://127.0.0.1:{DEFAULT_HTTP_PORT}/api"),
            negotiation_timeout: Duration::from_secs(NEGOTIATION_TIMEOUT_SECS),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("TANDEM_SIGNALING_URL").filter(|v| !v.is_empty()) {
            config.signaling_url = url;
        }

        if let Some(url) = lookup("TANDEM_API_URL").filter(|v| !v.is_empty()) {
            config.api_url = url;
        }

        if let Some(val) = lookup("TANDEM_NEGOTIATION_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.negotiation_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid TANDEM_NEGOTIATION_TIMEOUT_SECS, using default"),
            }
        }

        if let Some(val) = lookup("TANDEM_ICE_SERVERS") {
            let servers: Vec<String> = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !servers.is_empty() {
                config.ice_servers = servers;
            }
        }

        config
    }
}
