use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use taylordash_broker::{BrokerStats, ConnectionState};
use taylordash_plugin::RouterStats;

use super::SERVICE_NAME;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub broker: BrokerHealth,
    pub router: RouterStats,
}

/// Broker link state plus its traffic counters.
#[derive(Debug, Serialize)]
pub struct BrokerHealth {
    pub state: ConnectionState,
    #[serde(flatten)]
    pub stats: BrokerStats,
}

#[derive(Debug, Serialize)]
pub struct ProbeStatus {
    pub status: &'static str,
    pub service: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Readiness {
    pub status: &'static str,
    pub service: &'static str,
    pub broker: ConnectionState,
}

/// GET /health — broker state, broker traffic and router statistics
pub async fn health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthReport>, (StatusCode, String)> {
    let router = state
        .router
        .stats()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    let broker = state.broker.state();

    Ok(Json(HealthReport {
        status: if broker == ConnectionState::Connected {
            "ok"
        } else {
            "degraded"
        },
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        broker: BrokerHealth {
            state: broker,
            stats: state.broker.stats(),
        },
        router,
    }))
}

/// GET /health/live — liveness probe
pub async fn live() -> Json<ProbeStatus> {
    Json(ProbeStatus {
        status: "alive",
        service: SERVICE_NAME,
    })
}

/// GET /health/ready — ready only while the broker link is up
pub async fn ready(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Readiness>, (StatusCode, String)> {
    let broker = state.broker.state();
    if broker != ConnectionState::Connected {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            format!("broker not ready: {broker}"),
        ));
    }
    Ok(Json(Readiness {
        status: "ready",
        service: SERVICE_NAME,
        broker,
    }))
}
