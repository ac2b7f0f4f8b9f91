// Shared test utilities for integration tests
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use taylordash_broker::{
    BrokerClient, BrokerError, BrokerTransport, ConnectionState, InboundMessage, ReconnectPolicy,
};
use taylordash_plugin::{EventRouter, OriginAllowlist, RouterConfig};
use taylordash_server::{config::ServerConfig, AppState};

pub const TEST_ORIGIN: &str = "http://localhost:5173";

/// Messages published through the test broker.
pub type Published = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

/// In-memory broker transport; connects only when `reachable` is true.
pub struct TestTransport {
    reachable: bool,
    published: Published,
    inbound: mpsc::UnboundedReceiver<InboundMessage>,
}

#[async_trait]
impl BrokerTransport for TestTransport {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        if self.reachable {
            Ok(())
        } else {
            Err(BrokerError::Connection("broker unreachable".into()))
        }
    }

    async fn subscribe(&mut self, _topics: &[String]) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn unsubscribe(&mut self, _topic: &str) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<InboundMessage>, BrokerError> {
        match self.inbound.recv().await {
            Some(message) => Ok(Some(message)),
            None => std::future::pending().await,
        }
    }

    async fn disconnect(&mut self) {}
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub published: Published,
    /// Messages the test broker delivers to the client.
    pub inbound: mpsc::UnboundedSender<InboundMessage>,
}

/// Create a test AppState backed by the in-memory broker
pub async fn test_app(reachable: bool) -> TestApp {
    let published: Published = Arc::new(Mutex::new(Vec::new()));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let transport = TestTransport {
        reachable,
        published: Arc::clone(&published),
        inbound: inbound_rx,
    };
    let policy = ReconnectPolicy {
        max_attempts: 0,
        ..ReconnectPolicy::default()
    };
    let broker = BrokerClient::start(transport, policy);

    let allowed_origins = OriginAllowlist::new([TEST_ORIGIN]).unwrap();
    let router = EventRouter::start(
        Arc::clone(&broker),
        RouterConfig {
            allowed_origins: allowed_origins.clone(),
            ..RouterConfig::default()
        },
    );
    broker.connect().unwrap();

    let expected = if reachable {
        ConnectionState::Connected
    } else {
        ConnectionState::Error
    };
    for _ in 0..100 {
        if broker.state() == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(broker.state(), expected);

    let config = ServerConfig {
        allowed_origins,
        ..ServerConfig::default()
    };
    TestApp {
        state: Arc::new(AppState {
            broker,
            router,
            config,
        }),
        published,
        inbound: inbound_tx,
    }
}
