//! TaylorDash event distribution server.
//!
//! Hosts the event router behind HTTP: sandboxes attach over the
//! `/plugins/events` WebSocket, operators query `/health`, and
//! `/api/v1/events/test` pushes a test event through the broker.

use std::sync::Arc;

use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use taylordash_broker::BrokerClient;
use taylordash_plugin::{EventRouter, OriginAllowlist};

pub mod api;
pub mod config;
pub mod ws;

use config::ServerConfig;

/// Shared application state.
pub struct AppState {
    pub broker: Arc<BrokerClient>,
    pub router: Arc<EventRouter>,
    pub config: ServerConfig,
}

/// Build the HTTP application.
pub fn app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    let api_routes = Router::new().route("/events/test", post(api::events::publish_test_event));

    Router::new()
        .route("/health", get(api::health::health))
        .route("/health/live", get(api::health::live))
        .route("/health/ready", get(api::health::ready))
        .route("/plugins/events", get(ws::plugin_events))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// CORS restricted to the same origins the plugin protocol accepts.
fn cors_layer(origins: &OriginAllowlist) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    tracing::info!("CORS allowed origins: {:?}", origins);
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}
