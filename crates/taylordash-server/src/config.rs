//! Server configuration.

use std::net::SocketAddr;

use taylordash_plugin::OriginAllowlist;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Configuration for the HTTP server and the sandbox bridge.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Outbound queue size per sandbox socket.
    pub channel_capacity: usize,
    /// Origins allowed to attach sandboxes and make CORS requests.
    pub allowed_origins: OriginAllowlist,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            channel_capacity: 256,
            allowed_origins: OriginAllowlist::default(),
        }
    }
}

impl ServerConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let bind = std::env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind.parse().unwrap_or_else(|e| {
            tracing::warn!(value = %bind, "invalid BIND_ADDR, using {DEFAULT_BIND_ADDR}: {e}");
            Self::default().bind_addr
        });

        Self {
            bind_addr,
            channel_capacity: std::env::var("PLUGIN_CHANNEL_CAPACITY")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|capacity| *capacity > 0)
                .unwrap_or(256),
            allowed_origins: OriginAllowlist::from_env(),
        }
    }
}
