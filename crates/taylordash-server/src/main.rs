use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use taylordash_broker::{BrokerClient, BrokerConfig, MqttTransport};
use taylordash_plugin::{EventRouter, RouterConfig};
use taylordash_server::{app, config::ServerConfig, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();

    // Broker client
    let broker_config = BrokerConfig::from_env();
    tracing::info!(
        host = %broker_config.host,
        port = broker_config.port,
        transport = ?broker_config.transport,
        client_id = %broker_config.client_id,
        "starting broker client"
    );
    let policy = broker_config.reconnect;
    let broker = BrokerClient::start(MqttTransport::new(broker_config), policy);

    // Event router, mirroring the known tracker topics
    let router = EventRouter::start(
        Arc::clone(&broker),
        RouterConfig {
            allowed_origins: config.allowed_origins.clone(),
            ..RouterConfig::default()
        },
    );
    broker
        .connect()
        .context("failed to start broker connection")?;

    let state = Arc::new(AppState {
        broker: Arc::clone(&broker),
        router: Arc::clone(&router),
        config: config.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "server started");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    router.stop().await;
    broker.stop().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => {
            tracing::error!("failed to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
    }
}
