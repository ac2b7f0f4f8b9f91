//! Broker client error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("connect timed out after {0}s")]
    ConnectTimeout(u64),

    #[error("not connected to broker")]
    NotConnected,

    #[error("broker client stopped")]
    Stopped,

    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("mqtt connection error: {0}")]
    MqttConnection(#[from] rumqttc::ConnectionError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
