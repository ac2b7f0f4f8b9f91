//! Broker transport seam and its rumqttc implementation.
//!
//! The [`BrokerClient`](crate::BrokerClient) driver owns exactly one
//! transport and decides when to connect, resubscribe and retry. A
//! transport only knows how to perform a single session.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeFilter, Transport,
};
use tracing::debug;

use crate::config::{BrokerConfig, TransportKind};
use crate::error::BrokerError;

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// One physical link to a publish/subscribe broker.
#[async_trait]
pub trait BrokerTransport: Send + 'static {
    /// Perform the connection handshake. Replaces any previous session.
    async fn connect(&mut self) -> Result<(), BrokerError>;

    /// Issue a broker-level subscribe for every topic in `topics`.
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Wait for the next inbound message.
    ///
    /// `Ok(None)` means the broker closed the session cleanly; `Err` means the
    /// link dropped.
    async fn recv(&mut self) -> Result<Option<InboundMessage>, BrokerError>;

    /// Close the session, if any.
    async fn disconnect(&mut self);
}

/// MQTT transport backed by rumqttc, over TCP or WebSocket.
pub struct MqttTransport {
    config: BrokerConfig,
    session: Option<(AsyncClient, EventLoop)>,
}

impl MqttTransport {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.broker_address(),
            self.config.port,
        );
        if self.config.transport == TransportKind::WebSocket {
            opts.set_transport(Transport::Ws);
        }
        if self.config.has_credentials() {
            opts.set_credentials(self.config.username.clone(), self.config.password.clone());
        }
        // rumqttc rejects keep-alives shorter than 5s.
        opts.set_keep_alive(self.config.keep_alive.max(Duration::from_secs(5)));
        opts
    }

    fn client(&self) -> Result<&AsyncClient, BrokerError> {
        self.session
            .as_ref()
            .map(|(client, _)| client)
            .ok_or(BrokerError::NotConnected)
    }
}

async fn await_connack(event_loop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match event_loop.poll().await? {
            Event::Incoming(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Success => {
                return Ok(());
            }
            Event::Incoming(Packet::ConnAck(ack)) => {
                return Err(BrokerError::Connection(format!(
                    "broker refused connection: {:?}",
                    ack.code
                )));
            }
            other => debug!(event = ?other, "mqtt event before connack"),
        }
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        self.session = None;
        let (client, mut event_loop) =
            AsyncClient::new(self.options(), self.config.request_capacity.max(1));

        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, await_connack(&mut event_loop)).await {
            Ok(Ok(())) => {
                self.session = Some((client, event_loop));
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BrokerError::ConnectTimeout(timeout.as_secs())),
        }
    }

    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        if topics.is_empty() {
            return Ok(());
        }
        let filters = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtLeastOnce));
        self.client()?.try_subscribe_many(filters)?;
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.client()?.try_unsubscribe(topic)?;
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client()?
            .try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<InboundMessage>, BrokerError> {
        let (_, event_loop) = self.session.as_mut().ok_or(BrokerError::NotConnected)?;
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(Some(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    }));
                }
                Ok(Event::Incoming(Packet::Disconnect))
                | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    self.session = None;
                    return Ok(None);
                }
                Ok(_) => {}
                Err(e) => {
                    self.session = None;
                    return Err(e.into());
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some((client, _)) = self.session.take() {
            if let Err(e) = client.try_disconnect() {
                debug!("mqtt disconnect request failed: {e}");
            }
        }
    }
}
