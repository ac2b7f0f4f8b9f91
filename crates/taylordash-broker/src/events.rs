//! Event model — the unit of information flowing from the broker to plugins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Internal topic on which synthesized connectivity events are emitted.
pub const CONNECTION_STATUS_TOPIC: &str = "system/connection_status";

/// Event type carried by events on [`CONNECTION_STATUS_TOPIC`].
pub const CONNECTION_STATUS_EVENT: &str = "connection_status";

/// Tracker topics mirrored to plugins, with the event type each one carries.
pub const KNOWN_TOPICS: &[(&str, &str)] = &[
    ("tracker/events/projects/created", "project_created"),
    ("tracker/events/projects/updated", "project_updated"),
    ("tracker/events/projects/deleted", "project_deleted"),
    ("tracker/events/components/created", "component_created"),
    ("tracker/events/components/updated", "component_updated"),
    ("tracker/events/components/linked", "component_linked"),
    ("tracker/events/components/unlinked", "component_unlinked"),
    ("tracker/events/tasks/created", "task_created"),
    ("tracker/events/tasks/updated", "task_updated"),
    ("tracker/events/tasks/completed", "task_completed"),
    ("tracker/events/tasks/assigned", "task_assigned"),
    ("tracker/events/system/health", "system_health"),
    (CONNECTION_STATUS_TOPIC, CONNECTION_STATUS_EVENT),
];

/// A domain event as delivered to subscribers.
///
/// `id` and `timestamp` are always populated once an event leaves the
/// broker client, even when the upstream message lacked them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Event {
    /// Create a new event with a generated id and the current time.
    pub fn new(event_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data,
            trace_id: None,
        }
    }

    /// Build an event from a decoded broker payload received on `topic`.
    ///
    /// Payloads in the tracker envelope shape (`kind`/`type` plus
    /// `payload`/`data`) are unpacked; any other object becomes `data` as-is
    /// and the type is derived from the topic. Non-object values are wrapped
    /// under a `value` key.
    pub fn from_payload(topic: &str, payload: Value, received_at: DateTime<Utc>) -> Self {
        let mut object = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                return Self {
                    id: Uuid::new_v4().to_string(),
                    event_type: event_type_for_topic(topic),
                    timestamp: received_at,
                    data: map,
                    trace_id: None,
                };
            }
        };

        let declared_type = ["type", "kind"]
            .iter()
            .find(|key| matches!(object.get(**key), Some(Value::String(s)) if !s.is_empty()))
            .copied();
        let body_key = ["data", "payload"]
            .iter()
            .find(|key| matches!(object.get(**key), Some(Value::Object(_))))
            .copied();

        let (Some(type_key), Some(body_key)) = (declared_type, body_key) else {
            // Bare object: every field is event data, untouched.
            return Self {
                id: Uuid::new_v4().to_string(),
                event_type: event_type_for_topic(topic),
                timestamp: received_at,
                data: object,
                trace_id: None,
            };
        };

        let event_type = take_string(&mut object, &[type_key])
            .unwrap_or_else(|| event_type_for_topic(topic));
        let data = match object.remove(body_key) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let id = take_string(&mut object, &["id", "idempotency_key"])
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let timestamp = take_string(&mut object, &["timestamp", "ts"])
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or(received_at);
        let trace_id = take_string(&mut object, &["trace_id"]);

        Self {
            id,
            event_type,
            timestamp,
            data,
            trace_id,
        }
    }

    /// Build the synthesized connectivity event for a state transition.
    pub fn connection_status(state: ConnectionState, attempt: u32, terminal: bool) -> Self {
        let mut data = Map::new();
        data.insert("status".to_string(), Value::String(state.as_str().to_string()));
        data.insert("connected".to_string(), Value::Bool(state == ConnectionState::Connected));
        data.insert("attempt".to_string(), Value::from(attempt));
        data.insert("terminal".to_string(), Value::Bool(terminal));
        Self::new(CONNECTION_STATUS_EVENT, data)
    }
}

/// Connection state of the broker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event type for a topic: the known-topic table, else the last two
/// segments joined by `_` (`tracker/metrics/cpu` → `metrics_cpu`).
pub fn event_type_for_topic(topic: &str) -> String {
    if let Some((_, event_type)) = KNOWN_TOPICS.iter().find(|(t, _)| *t == topic) {
        return (*event_type).to_string();
    }
    let segments: Vec<&str> = topic.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [] => "unknown".to_string(),
        [only] => (*only).to_string(),
        [.., parent, leaf] => format!("{parent}_{leaf}"),
    }
}

/// MQTT topic filter matching (`+` one level, `#` the remainder).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn take_string(object: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match object.remove(*key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    })
}
