//! Broker connection configuration.

use std::time::Duration;

use crate::backoff::ReconnectPolicy;

/// Wire transport used to reach the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Plain MQTT over TCP.
    Tcp,
    /// MQTT over WebSocket (browser-compatible).
    WebSocket,
}

/// Configuration for the broker client.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub transport: TransportKind,
    /// Request path for the WebSocket transport (default: `/mqtt`).
    pub ws_path: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Capacity of the rumqttc request queue.
    pub request_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: default_client_id(),
            transport: TransportKind::Tcp,
            ws_path: "/mqtt".to_string(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            request_capacity: 128,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl BrokerConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let transport = match std::env::var("MQTT_TRANSPORT")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "ws" | "websocket" => TransportKind::WebSocket,
            _ => TransportKind::Tcp,
        };

        Self {
            host: std::env::var("MQTT_HOST").unwrap_or(defaults.host),
            port: env_parse("MQTT_PORT").unwrap_or(defaults.port),
            username: std::env::var("MQTT_USERNAME").unwrap_or_default(),
            password: std::env::var("MQTT_PASSWORD").unwrap_or_default(),
            client_id: std::env::var("MQTT_CLIENT_ID").unwrap_or(defaults.client_id),
            transport,
            ws_path: std::env::var("MQTT_WS_PATH").unwrap_or(defaults.ws_path),
            keep_alive: env_parse("MQTT_KEEP_ALIVE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.keep_alive),
            connect_timeout: env_parse("MQTT_CONNECT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            request_capacity: env_parse("MQTT_REQUEST_CAPACITY")
                .unwrap_or(defaults.request_capacity),
            reconnect: ReconnectPolicy {
                base_delay: env_parse("MQTT_BASE_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.reconnect.base_delay),
                max_delay: env_parse("MQTT_MAX_DELAY_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.reconnect.max_delay),
                max_attempts: env_parse("MQTT_MAX_RETRIES")
                    .unwrap_or(defaults.reconnect.max_attempts),
            },
        }
    }

    /// Broker address for the configured transport.
    ///
    /// rumqttc expects a full URL as the host for WebSocket connections.
    pub fn broker_address(&self) -> String {
        match self.transport {
            TransportKind::Tcp => self.host.clone(),
            TransportKind::WebSocket => {
                format!("ws://{}:{}{}", self.host, self.port, self.ws_path)
            }
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

fn default_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("taylordash-{}", &id[..8])
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_config_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 1883);
        assert_eq!(config.transport, TransportKind::Tcp);
        assert!(config.client_id.starts_with("taylordash-"));
        assert_eq!(config.client_id.len(), "taylordash-".len() + 8);
        assert!(!config.has_credentials());
        assert_eq!(config.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn test_broker_config_from_env() {
        std::env::set_var("MQTT_HOST", "broker.internal");
        std::env::set_var("MQTT_PORT", "9001");
        std::env::set_var("MQTT_USERNAME", "tracker");
        std::env::set_var("MQTT_PASSWORD", "secret");
        std::env::set_var("MQTT_TRANSPORT", "ws");
        std::env::set_var("MQTT_MAX_RETRIES", "3");
        std::env::set_var("MQTT_BASE_DELAY_MS", "250");

        let config = BrokerConfig::from_env();
        assert_eq!(config.host, "broker.internal");
        assert_eq!(config.port, 9001);
        assert!(config.has_credentials());
        assert_eq!(config.password, "secret");
        assert_eq!(config.transport, TransportKind::WebSocket);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(250));
        assert_eq!(config.broker_address(), "ws://broker.internal:9001/mqtt");

        // Clean up
        for key in [
            "MQTT_HOST",
            "MQTT_PORT",
            "MQTT_USERNAME",
            "MQTT_PASSWORD",
            "MQTT_TRANSPORT",
            "MQTT_MAX_RETRIES",
            "MQTT_BASE_DELAY_MS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_tcp_address_is_bare_host() {
        let config = BrokerConfig::default();
        assert_eq!(config.broker_address(), "localhost");
    }
}
