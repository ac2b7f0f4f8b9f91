//! Broker client — one resilient connection shared by every subscriber.
//!
//! `BrokerClient` is a handle to a single driver task that owns the
//! transport. The handler table lives outside the driver so that
//! `subscribe`/`unsubscribe` take effect immediately for the caller, and it
//! survives disconnects: every topic in it is re-subscribed on each
//! successful connect.
//!
//! State machine:
//!
//! ```text
//! disconnected ──connect()──► connecting ──ok──► connected
//!      ▲                          │                  │
//!      │                        fail               close/drop
//!      │                          ▼                  │
//!      └──── retry (backoff) ◄── error ◄─────────────┘
//! ```
//!
//! After `max_attempts` failed retries the client stays in `error` until
//! the host calls [`BrokerClient::connect`] again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::ReconnectPolicy;
use crate::error::BrokerError;
use crate::events::{topic_matches, ConnectionState, Event, CONNECTION_STATUS_TOPIC};
use crate::handlers::{run_isolated, HandlerResult};
use crate::transport::{BrokerTransport, InboundMessage};

/// Callback invoked with the concrete topic and the event.
pub type EventHandler = Arc<dyn Fn(&str, &Event) -> HandlerResult + Send + Sync>;

// ─── Handler table ──────────────────────────────────────────────────────

#[derive(Default)]
struct HandlerTable {
    next_id: u64,
    /// Topic filter → handlers in registration order.
    topics: HashMap<String, Vec<(u64, EventHandler)>>,
}

impl HandlerTable {
    /// Returns the handler id and whether it is the first for `topic`.
    fn insert(&mut self, topic: &str, handler: EventHandler) -> (u64, bool) {
        self.next_id += 1;
        let id = self.next_id;
        let entry = self.topics.entry(topic.to_string()).or_default();
        let first = entry.is_empty();
        entry.push((id, handler));
        (id, first)
    }

    /// Returns `true` when the removed handler was the last for `topic`.
    fn remove(&mut self, topic: &str, id: u64) -> bool {
        let Some(entry) = self.topics.get_mut(topic) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|(handler_id, _)| *handler_id != id);
        if entry.len() == before {
            return false;
        }
        if entry.is_empty() {
            self.topics.remove(topic);
            return true;
        }
        false
    }

    fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Topics that need a physical subscription at the broker.
    fn broker_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .topics
            .keys()
            .filter(|topic| !is_internal(topic))
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    fn matching(&self, topic: &str) -> Vec<EventHandler> {
        self.topics
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .flat_map(|(_, handlers)| handlers.iter().map(|(_, h)| Arc::clone(h)))
            .collect()
    }
}

fn is_internal(topic: &str) -> bool {
    topic == CONNECTION_STATUS_TOPIC
}

// ─── Commands ───────────────────────────────────────────────────────────

#[derive(Debug)]
enum Command {
    Connect,
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, payload: Vec<u8> },
}

// ─── Statistics ─────────────────────────────────────────────────────────

/// Snapshot of broker traffic since the client started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Messages received from the broker, malformed ones included.
    pub received: u64,
    /// Messages dropped because the payload was not JSON.
    pub malformed: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
    /// Reconnect attempts made by the backoff loop.
    pub reconnects: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    malformed: AtomicU64,
    handler_failures: AtomicU64,
    reconnects: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BrokerStats {
        BrokerStats {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

// ─── Subscription handle ────────────────────────────────────────────────

/// Registration of one handler under one topic.
///
/// Dropping it leaves the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    topic: String,
    id: u64,
    handlers: Arc<Mutex<HandlerTable>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Remove this handler. When it was the last one for the topic, a
    /// broker-level unsubscribe is issued.
    pub fn unsubscribe(self) {
        let last = self.handlers.lock().unwrap().remove(&self.topic, self.id);
        if last && !is_internal(&self.topic) {
            let _ = self.commands.send(Command::Unsubscribe(self.topic));
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

// ─── Client ─────────────────────────────────────────────────────────────

/// Wire envelope used by [`BrokerClient::publish_event`].
#[derive(Debug, Serialize)]
struct PublishEnvelope<'a> {
    trace_id: &'a str,
    ts: String,
    kind: &'a str,
    idempotency_key: String,
    payload: &'a serde_json::Value,
}

/// Handle to the broker connection.
pub struct BrokerClient {
    handlers: Arc<Mutex<HandlerTable>>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerClient {
    /// Spawn the driver task for `transport`. The client starts
    /// `disconnected`; call [`connect`](Self::connect) to open the link.
    pub fn start<T: BrokerTransport>(transport: T, policy: ReconnectPolicy) -> Arc<Self> {
        let handlers = Arc::new(Mutex::new(HandlerTable::default()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let shutdown = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let driver = Driver {
            transport,
            policy,
            handlers: Arc::clone(&handlers),
            commands: commands_rx,
            state: state_tx,
            counters: Arc::clone(&counters),
            shutdown: shutdown.clone(),
            attempt: 0,
            active: HashSet::new(),
        };
        let join = tokio::spawn(driver.run());

        Arc::new(Self {
            handlers,
            commands: commands_tx,
            state: state_rx,
            counters,
            shutdown,
            join: Mutex::new(Some(join)),
        })
    }

    /// Open the broker connection. No-op while connecting or connected;
    /// from the exhausted `error` state it starts a fresh retry cycle.
    pub fn connect(&self) -> Result<(), BrokerError> {
        if matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return Ok(());
        }
        self.commands
            .send(Command::Connect)
            .map_err(|_| BrokerError::Stopped)
    }

    /// Register `handler` for `topic` (an MQTT filter; `+`/`#` allowed).
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&str, &Event) -> HandlerResult + Send + Sync + 'static,
    {
        let topic = topic.into();
        let (id, first) = self
            .handlers
            .lock()
            .unwrap()
            .insert(&topic, Arc::new(handler));
        if first && !is_internal(&topic) {
            let _ = self.commands.send(Command::Subscribe(topic.clone()));
        }
        Subscription {
            topic,
            id,
            handlers: Arc::clone(&self.handlers),
            commands: self.commands.clone(),
        }
    }

    /// Publish `payload` as JSON. Best effort: while not connected the call
    /// is dropped with a warning and `NotConnected` is returned.
    pub fn publish<P: Serialize>(&self, topic: &str, payload: &P) -> Result<(), BrokerError> {
        if self.state() != ConnectionState::Connected {
            warn!(topic = %topic, state = %self.state(), "not connected, dropping publish");
            return Err(BrokerError::NotConnected);
        }
        let payload = serde_json::to_vec(payload)?;
        self.commands
            .send(Command::Publish {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|_| BrokerError::Stopped)
    }

    /// Publish a tracker event envelope and return its trace id.
    pub fn publish_event(
        &self,
        topic: &str,
        kind: &str,
        payload: &serde_json::Value,
        trace_id: Option<String>,
    ) -> Result<String, BrokerError> {
        let trace_id = trace_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        let envelope = PublishEnvelope {
            trace_id: &trace_id,
            ts: now.to_rfc3339(),
            kind,
            idempotency_key: format!("{kind}_{}_{}", now.timestamp_millis(), &suffix[..8]),
            payload,
        };
        self.publish(topic, &envelope)?;
        debug!(topic = %topic, kind = %kind, trace_id = %trace_id, "published event");
        Ok(trace_id)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Traffic counters since the client started.
    pub fn stats(&self) -> BrokerStats {
        self.counters.snapshot()
    }

    /// Number of distinct topics with at least one handler.
    pub fn topic_count(&self) -> usize {
        self.handlers.lock().unwrap().topics.len()
    }

    /// Tear down the connection and stop the driver task.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let join = self.join.lock().unwrap().take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                error!("broker driver task failed: {e}");
            }
        }
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ─── Driver ─────────────────────────────────────────────────────────────

enum Phase {
    Idle,
    Connecting,
    Connected,
    Backoff(Duration),
    Stopped,
}

struct Driver<T> {
    transport: T,
    policy: ReconnectPolicy,
    handlers: Arc<Mutex<HandlerTable>>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    /// Failed attempts since the last successful connect.
    attempt: u32,
    /// Topics subscribed at the broker in the current session.
    active: HashSet<String>,
}

impl<T: BrokerTransport> Driver<T> {
    async fn run(mut self) {
        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Connecting => self.connecting().await,
                Phase::Connected => self.connected().await,
                Phase::Backoff(delay) => self.backoff(delay).await,
                Phase::Stopped => break,
            };
        }

        self.transport.disconnect().await;
        if *self.state.borrow() != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected, false);
        }
        info!("broker client stopped");
    }

    async fn idle(&mut self) -> Phase {
        loop {
            let command = tokio::select! {
                _ = self.shutdown.cancelled() => return Phase::Stopped,
                command = self.commands.recv() => command,
            };
            match command {
                Some(Command::Connect) => {
                    self.attempt = 0;
                    return Phase::Connecting;
                }
                Some(command) => self.drop_offline(command),
                None => return Phase::Stopped,
            }
        }
    }

    async fn connecting(&mut self) -> Phase {
        self.transition(ConnectionState::Connecting, false);
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => return Phase::Stopped,
            result = self.transport.connect() => result,
        };

        match result {
            Ok(()) => {
                self.attempt = 0;
                self.transition(ConnectionState::Connected, false);
                let topics = self.handlers.lock().unwrap().broker_topics();
                self.active.clear();
                let result = self.transport.subscribe(&topics).await;
                match result {
                    Ok(()) => {
                        if !topics.is_empty() {
                            info!(count = topics.len(), "resubscribed broker topics");
                        }
                        self.active.extend(topics);
                    }
                    Err(e) => {
                        warn!(count = topics.len(), "resubscribe after connect failed: {e}");
                    }
                }
                Phase::Connected
            }
            Err(e) => {
                warn!(attempt = self.attempt, "broker connection failed: {e}");
                self.schedule_retry(ConnectionState::Error)
            }
        }
    }

    async fn connected(&mut self) -> Phase {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Phase::Stopped,
                command = self.commands.recv() => match command {
                    Some(command) => self.execute(command).await,
                    None => return Phase::Stopped,
                },
                received = self.transport.recv() => match received {
                    Ok(Some(message)) => self.deliver(message),
                    Ok(None) => {
                        info!("broker closed the connection");
                        return self.schedule_retry(ConnectionState::Disconnected);
                    }
                    Err(e) => {
                        warn!("broker connection lost: {e}");
                        return self.schedule_retry(ConnectionState::Disconnected);
                    }
                },
            }
        }
    }

    async fn backoff(&mut self, delay: Duration) -> Phase {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Phase::Stopped,
                _ = &mut sleep => {
                    Counters::bump(&self.counters.reconnects);
                    return Phase::Connecting;
                }
                command = self.commands.recv() => match command {
                    // A retry is already scheduled.
                    Some(Command::Connect) => {}
                    Some(command) => self.drop_offline(command),
                    None => return Phase::Stopped,
                },
            }
        }
    }

    /// Count a failure and pick the next phase: a delayed retry, or the
    /// terminal `error` state once the ceiling is exceeded.
    fn schedule_retry(&mut self, state: ConnectionState) -> Phase {
        self.attempt += 1;
        match self.policy.delay(self.attempt) {
            Some(delay) => {
                self.transition(state, false);
                info!(
                    attempt = self.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling broker reconnect"
                );
                Phase::Backoff(delay)
            }
            None => {
                error!(
                    max_attempts = self.policy.max_attempts,
                    "broker reconnect attempts exhausted, waiting for explicit connect"
                );
                self.transition(ConnectionState::Error, true);
                Phase::Idle
            }
        }
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Connect => {}
            Command::Subscribe(topic) => {
                let wanted = self.handlers.lock().unwrap().contains(&topic);
                // Already covered by the post-connect resubscribe.
                if !wanted || self.active.contains(&topic) {
                    return;
                }
                let result = self.transport.subscribe(std::slice::from_ref(&topic)).await;
                match result {
                    Ok(()) => {
                        debug!(topic = %topic, "subscribed");
                        self.active.insert(topic);
                    }
                    Err(e) => warn!(topic = %topic, "broker subscribe failed: {e}"),
                }
            }
            Command::Unsubscribe(topic) => {
                // Re-subscribed since the request was queued.
                let wanted = self.handlers.lock().unwrap().contains(&topic);
                if wanted {
                    return;
                }
                self.active.remove(&topic);
                match self.transport.unsubscribe(&topic).await {
                    Ok(()) => debug!(topic = %topic, "unsubscribed"),
                    Err(e) => warn!(topic = %topic, "broker unsubscribe failed: {e}"),
                }
            }
            Command::Publish { topic, payload } => {
                if let Err(e) = self.transport.publish(&topic, payload).await {
                    warn!(topic = %topic, "publish failed: {e}");
                }
            }
        }
    }

    fn drop_offline(&self, command: Command) {
        match command {
            Command::Publish { topic, .. } => {
                warn!(topic = %topic, "not connected, dropping publish");
            }
            // The handler table is replayed on the next connect.
            Command::Subscribe(_) | Command::Unsubscribe(_) | Command::Connect => {}
        }
    }

    fn deliver(&self, message: InboundMessage) {
        Counters::bump(&self.counters.received);
        let payload: serde_json::Value = match serde_json::from_slice(&message.payload) {
            Ok(value) => value,
            Err(e) => {
                Counters::bump(&self.counters.malformed);
                error!(topic = %message.topic, "dropping malformed broker payload: {e}");
                return;
            }
        };
        let event = Event::from_payload(&message.topic, payload, Utc::now());
        self.dispatch(&message.topic, &event);
    }

    fn dispatch(&self, topic: &str, event: &Event) {
        let handlers = self.handlers.lock().unwrap().matching(topic);
        for handler in handlers {
            if !run_isolated("broker", topic, || handler(topic, event)) {
                Counters::bump(&self.counters.handler_failures);
            }
        }
    }

    fn transition(&self, state: ConnectionState, terminal: bool) {
        self.state.send_replace(state);
        info!(state = %state, attempt = self.attempt, terminal, "broker connection state changed");
        let event = Event::connection_status(state, self.attempt, terminal);
        self.dispatch(CONNECTION_STATUS_TOPIC, &event);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::time::Instant;

    type Inbound = Result<Option<InboundMessage>, BrokerError>;

    #[derive(Default)]
    struct Recorder {
        connects: Vec<Instant>,
        subscribed: Vec<Vec<String>>,
        unsubscribed: Vec<String>,
        published: Vec<(String, Vec<u8>)>,
    }

    /// In-memory transport driven by the test.
    struct FakeTransport {
        log: Arc<Mutex<Recorder>>,
        /// Outcome of each successive connect; `default_ok` once drained.
        outcomes: VecDeque<bool>,
        default_ok: bool,
        inbound: mpsc::UnboundedReceiver<Inbound>,
    }

    #[async_trait]
    impl BrokerTransport for FakeTransport {
        async fn connect(&mut self) -> Result<(), BrokerError> {
            self.log.lock().unwrap().connects.push(Instant::now());
            if self.outcomes.pop_front().unwrap_or(self.default_ok) {
                Ok(())
            } else {
                Err(BrokerError::Connection("refused".into()))
            }
        }

        async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
            self.log.lock().unwrap().subscribed.push(topics.to_vec());
            Ok(())
        }

        async fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
            self.log.lock().unwrap().unsubscribed.push(topic.to_string());
            Ok(())
        }

        async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
            self.log
                .lock()
                .unwrap()
                .published
                .push((topic.to_string(), payload));
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<InboundMessage>, BrokerError> {
            match self.inbound.recv().await {
                Some(next) => next,
                None => std::future::pending().await,
            }
        }

        async fn disconnect(&mut self) {}
    }

    struct Harness {
        client: Arc<BrokerClient>,
        log: Arc<Mutex<Recorder>>,
        inbound: mpsc::UnboundedSender<Inbound>,
    }

    fn harness(outcomes: &[bool], default_ok: bool) -> Harness {
        let log = Arc::new(Mutex::new(Recorder::default()));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let transport = FakeTransport {
            log: Arc::clone(&log),
            outcomes: outcomes.iter().copied().collect(),
            default_ok,
            inbound: inbound_rx,
        };
        Harness {
            client: BrokerClient::start(transport, ReconnectPolicy::default()),
            log,
            inbound: inbound_tx,
        }
    }

    fn message(topic: &str, payload: &str) -> Inbound {
        Ok(Some(InboundMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        }))
    }

    /// Let the driver task process everything queued so far.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn collect_events(client: &BrokerClient, topic: &str) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = client.subscribe(topic, move |_, event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        seen
    }

    // ── Connection lifecycle ──────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_starts_disconnected_until_connect() {
        let h = harness(&[], true);
        settle().await;
        assert_eq!(h.client.state(), ConnectionState::Disconnected);
        assert!(h.log.lock().unwrap().connects.is_empty());

        h.client.connect().unwrap();
        settle().await;
        assert_eq!(h.client.state(), ConnectionState::Connected);
        assert_eq!(h.log.lock().unwrap().connects.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let h = harness(&[], true);
        h.client.connect().unwrap();
        settle().await;
        h.client.connect().unwrap();
        h.client.connect().unwrap();
        settle().await;
        assert_eq!(h.log.lock().unwrap().connects.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_events_follow_transitions() {
        let h = harness(&[], true);
        let statuses = collect_events(&h.client, CONNECTION_STATUS_TOPIC);
        h.client.connect().unwrap();
        settle().await;

        let seen: Vec<String> = statuses
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.data["status"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(seen, vec!["connecting", "connected"]);
        // The internal topic is never subscribed at the broker.
        assert!(h
            .log
            .lock()
            .unwrap()
            .subscribed
            .iter()
            .all(|topics| !topics.contains(&CONNECTION_STATUS_TOPIC.to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sequence_stops_at_ceiling() {
        let h = harness(&[true], false);
        let statuses = collect_events(&h.client, CONNECTION_STATUS_TOPIC);
        h.client.connect().unwrap();
        settle().await;
        assert_eq!(h.client.state(), ConnectionState::Connected);

        let dropped_at = Instant::now();
        h.inbound
            .send(Err(BrokerError::Connection("reset by peer".into())))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        let connects = h.log.lock().unwrap().connects.clone();
        assert_eq!(connects.len(), 6, "initial connect plus five retries");
        assert_eq!(connects[1] - dropped_at, Duration::from_secs(1));
        let gaps: Vec<Duration> = connects[1..].windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ]
        );
        assert_eq!(h.client.state(), ConnectionState::Error);
        let last = statuses.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.data["terminal"], true);

        // No sixth retry without intervention.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.log.lock().unwrap().connects.len(), 6);
        assert_eq!(h.client.stats().reconnects, 5);

        // Explicit connect starts a fresh cycle.
        h.client.connect().unwrap();
        settle().await;
        assert_eq!(h.log.lock().unwrap().connects.len(), 7);
        assert_eq!(h.client.stats().reconnects, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_initial_connect_retries() {
        let h = harness(&[false, true], true);
        h.client.connect().unwrap();
        settle().await;
        assert_eq!(h.client.state(), ConnectionState::Error);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(h.client.state(), ConnectionState::Connected);
        assert_eq!(h.log.lock().unwrap().connects.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_reconnect() {
        let h = harness(&[], true);
        let _projects = h.client.subscribe("tracker/events/projects/created", |_, _| Ok(()));
        let _tasks = h.client.subscribe("tracker/events/tasks/created", |_, _| Ok(()));
        h.client.connect().unwrap();
        settle().await;

        h.inbound.send(Ok(None)).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.client.state(), ConnectionState::Connected);

        let log = h.log.lock().unwrap();
        assert_eq!(log.connects.len(), 2);
        let expected = vec![
            "tracker/events/projects/created".to_string(),
            "tracker/events/tasks/created".to_string(),
        ];
        assert_eq!(log.subscribed.first(), Some(&expected));
        assert_eq!(log.subscribed.last(), Some(&expected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_disconnects() {
        let h = harness(&[], true);
        h.client.connect().unwrap();
        settle().await;
        h.client.stop().await;
        assert_eq!(h.client.state(), ConnectionState::Disconnected);
        assert!(matches!(h.client.connect(), Err(BrokerError::Stopped)));
    }

    // ── Subscriptions ─────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_broker_subscribe_only_for_first_handler() {
        let h = harness(&[], true);
        h.client.connect().unwrap();
        settle().await;

        let first = h.client.subscribe("a/b", |_, _| Ok(()));
        let second = h.client.subscribe("a/b", |_, _| Ok(()));
        settle().await;
        assert_eq!(h.log.lock().unwrap().subscribed.len(), 2); // resubscribe + a/b
        assert_eq!(h.client.topic_count(), 1);

        first.unsubscribe();
        settle().await;
        assert!(h.log.lock().unwrap().unsubscribed.is_empty());

        second.unsubscribe();
        settle().await;
        assert_eq!(h.log.lock().unwrap().unsubscribed, vec!["a/b".to_string()]);
        assert_eq!(h.client.topic_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_while_connecting_not_repeated() {
        let h = harness(&[], true);
        h.client.connect().unwrap();
        // Queued behind Connect, then covered by the resubscribe.
        let _sub = h.client.subscribe("a/b", |_, _| Ok(()));
        settle().await;
        assert_eq!(h.client.state(), ConnectionState::Connected);
        assert_eq!(
            h.log.lock().unwrap().subscribed,
            vec![vec!["a/b".to_string()]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_after_unsubscribe_reaches_broker() {
        let h = harness(&[], true);
        h.client.connect().unwrap();
        settle().await;

        let first = h.client.subscribe("a/b", |_, _| Ok(()));
        settle().await;
        first.unsubscribe();
        settle().await;
        let _second = h.client.subscribe("a/b", |_, _| Ok(()));
        settle().await;

        let log = h.log.lock().unwrap();
        assert_eq!(log.unsubscribed, vec!["a/b".to_string()]);
        let a_b = log.subscribed.iter().filter(|topics| topics.contains(&"a/b".to_string()));
        assert_eq!(a_b.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribed_handler_not_invoked() {
        let h = harness(&[], true);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let sub = h.client.subscribe("a/b", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        h.client.connect().unwrap();
        settle().await;

        h.inbound.send(message("a/b", "{}")).unwrap();
        settle().await;
        sub.unsubscribe();
        h.inbound.send(message("a/b", "{}")).unwrap();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wildcard_handler_receives_concrete_topic() {
        let h = harness(&[], true);
        let topics = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&topics);
        let _sub = h.client.subscribe("tracker/events/+/+", move |topic, _| {
            sink.lock().unwrap().push(topic.to_string());
            Ok(())
        });
        h.client.connect().unwrap();
        settle().await;

        h.inbound
            .send(message("tracker/events/projects/created", r#"{"project_id":"1"}"#))
            .unwrap();
        settle().await;
        assert_eq!(
            *topics.lock().unwrap(),
            vec!["tracker/events/projects/created".to_string()]
        );
    }

    // ── Delivery ──────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_event_built_from_payload() {
        let h = harness(&[], true);
        let events = collect_events(&h.client, "tracker/events/projects/created");
        h.client.connect().unwrap();
        settle().await;

        h.inbound
            .send(message(
                "tracker/events/projects/created",
                r#"{"project_id":"123","project_name":"Demo"}"#,
            ))
            .unwrap();
        settle().await;

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "project_created");
        assert_eq!(events[0].data["project_id"], "123");
        assert!(!events[0].id.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_handlers_are_isolated() {
        let h = harness(&[], true);
        let count = Arc::new(AtomicUsize::new(0));
        let _err = h.client.subscribe("a/b", |_, _| Err("handler error".into()));
        let _panic = h.client.subscribe("a/b", |_, _| panic!("handler bug"));
        let counter = Arc::clone(&count);
        let _ok = h.client.subscribe("a/b", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        h.client.connect().unwrap();
        settle().await;

        h.inbound.send(message("a/b", "{}")).unwrap();
        h.inbound.send(message("a/b", "{}")).unwrap();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(h.client.state(), ConnectionState::Connected);
        assert_eq!(h.client.stats().handler_failures, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_dropped() {
        let h = harness(&[], true);
        let events = collect_events(&h.client, "a/b");
        h.client.connect().unwrap();
        settle().await;

        h.inbound.send(message("a/b", "not json {")).unwrap();
        h.inbound.send(message("a/b", r#"{"ok":true}"#)).unwrap();
        settle().await;
        assert_eq!(events.lock().unwrap().len(), 1);
        assert_eq!(h.client.state(), ConnectionState::Connected);
        assert_eq!(h.log.lock().unwrap().connects.len(), 1);
        let stats = h.client.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.handler_failures, 0);
    }

    // ── Publishing ────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_publish_dropped_while_disconnected() {
        let h = harness(&[], true);
        let result = h.client.publish("a/b", &serde_json::json!({"x": 1}));
        assert!(matches!(result, Err(BrokerError::NotConnected)));

        h.client.connect().unwrap();
        settle().await;
        h.client.publish("a/b", &serde_json::json!({"x": 1})).unwrap();
        settle().await;

        let log = h.log.lock().unwrap();
        assert_eq!(log.published.len(), 1);
        assert_eq!(log.published[0].0, "a/b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_event_envelope() {
        let h = harness(&[], true);
        h.client.connect().unwrap();
        settle().await;

        let trace_id = h
            .client
            .publish_event(
                "tracker/events/components/created",
                "component.created",
                &serde_json::json!({"component_id": "comp-123"}),
                None,
            )
            .unwrap();
        settle().await;

        let log = h.log.lock().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&log.published[0].1).unwrap();
        assert_eq!(body["trace_id"], trace_id.as_str());
        assert_eq!(body["kind"], "component.created");
        assert_eq!(body["payload"]["component_id"], "comp-123");
        assert!(body["idempotency_key"]
            .as_str()
            .unwrap()
            .starts_with("component.created_"));
        assert!(Uuid::parse_str(&trace_id).is_ok());
    }
}
