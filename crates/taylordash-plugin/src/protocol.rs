//! Host ↔ sandbox message protocol.
//!
//! Every message is a JSON object tagged by `type`. Field names are
//! camelCase on the wire (`pluginId`, `eventType`).

use serde::{Deserialize, Serialize};

use taylordash_broker::Event;

use crate::error::PluginError;

/// Lifecycle signal sent by a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Ready,
    Error,
    Disconnected,
}

/// Outcome carried by a subscription acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
}

/// Sandbox → host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SandboxMessage {
    Subscribe {
        topics: Vec<String>,
        #[serde(alias = "sandboxId")]
        plugin_id: String,
    },
    Unsubscribe {
        topics: Vec<String>,
        #[serde(alias = "sandboxId")]
        plugin_id: String,
    },
    Status {
        status: SandboxStatus,
        #[serde(alias = "sandboxId")]
        plugin_id: String,
    },
}

impl SandboxMessage {
    /// Decode and validate a raw message from a sandbox.
    pub fn parse(raw: &str) -> Result<Self, PluginError> {
        let message: Self = serde_json::from_str(raw)?;
        message.validate()?;
        Ok(message)
    }

    pub fn plugin_id(&self) -> &str {
        match self {
            Self::Subscribe { plugin_id, .. }
            | Self::Unsubscribe { plugin_id, .. }
            | Self::Status { plugin_id, .. } => plugin_id,
        }
    }

    fn validate(&self) -> Result<(), PluginError> {
        if self.plugin_id().trim().is_empty() {
            return Err(PluginError::Protocol("pluginId must not be empty".into()));
        }
        match self {
            Self::Subscribe { topics, .. } | Self::Unsubscribe { topics, .. } => {
                if topics.is_empty() {
                    return Err(PluginError::Protocol("topics must not be empty".into()));
                }
                if topics.iter().any(|topic| topic.is_empty()) {
                    return Err(PluginError::Protocol("topics must be non-empty strings".into()));
                }
                Ok(())
            }
            Self::Status { .. } => Ok(()),
        }
    }
}

/// Host → sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HostMessage {
    SubscriptionConfirmed {
        topics: Vec<String>,
        status: AckStatus,
    },
    Event {
        event_type: String,
        data: Event,
        topic: String,
        plugin_id: String,
    },
}

impl HostMessage {
    /// Event delivery envelope for one sandbox.
    pub fn event(topic: &str, event: &Event, plugin_id: &str) -> Self {
        Self::Event {
            event_type: event.event_type.clone(),
            data: event.clone(),
            topic: topic.to_string(),
            plugin_id: plugin_id.to_string(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PluginError> {
        Ok(serde_json::from_str(raw)?)
    }
}
