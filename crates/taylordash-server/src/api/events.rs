use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use taylordash_broker::BrokerError;

use crate::AppState;

/// Topic the test event is published on.
pub const TEST_EVENT_TOPIC: &str = "tracker/events/test/api";

/// Event kind of the test event.
pub const TEST_EVENT_KIND: &str = "test_event";

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub status: &'static str,
    pub trace_id: String,
    pub message: &'static str,
}

/// POST /api/v1/events/test — publish a test event through the broker
pub async fn publish_test_event(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PublishResponse>, (StatusCode, String)> {
    let payload = serde_json::json!({
        "message": "Test event from API",
        "timestamp": Utc::now().to_rfc3339(),
    });

    let trace_id = state
        .broker
        .publish_event(TEST_EVENT_TOPIC, TEST_EVENT_KIND, &payload, None)
        .map_err(|e| match e {
            BrokerError::NotConnected => (
                StatusCode::SERVICE_UNAVAILABLE,
                "broker not connected".to_string(),
            ),
            e => {
                tracing::error!("failed to publish test event: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to publish test event: {e}"),
                )
            }
        })?;

    tracing::info!(trace_id = %trace_id, "test event published");
    Ok(Json(PublishResponse {
        status: "success",
        trace_id,
        message: "Test event published",
    }))
}
