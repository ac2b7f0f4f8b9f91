//! TaylorDash broker client — resilient MQTT connection with topic fan-out.
//!
//! Owns the single connection to the message broker, replays topic
//! subscriptions after every reconnect and delivers inbound messages as
//! [`Event`]s to locally registered handlers.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use client::{BrokerClient, BrokerStats, EventHandler, Subscription};
pub use config::{BrokerConfig, TransportKind};
pub use error::BrokerError;
pub use events::{
    event_type_for_topic, topic_matches, ConnectionState, Event, CONNECTION_STATUS_EVENT,
    CONNECTION_STATUS_TOPIC, KNOWN_TOPICS,
};
pub use handlers::{run_isolated, HandlerError, HandlerResult};
pub use transport::{BrokerTransport, InboundMessage, MqttTransport};
