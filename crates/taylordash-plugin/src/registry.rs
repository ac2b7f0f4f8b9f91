//! Event router — the host-side trust boundary and fan-out point.
//!
//! The `EventRouter` owns the registry of mounted sandboxes. It mirrors a
//! fixed allowlist of broker topics, validates the origin of every
//! sandbox message and re-dispatches each broker event only to the
//! sandboxes subscribed to that exact topic.
//!
//! All registry mutation happens inside one driver task; the public
//! methods only enqueue commands.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taylordash_broker::{
    BrokerClient, Event, HandlerError, Subscription, CONNECTION_STATUS_EVENT,
    CONNECTION_STATUS_TOPIC, KNOWN_TOPICS,
};

use crate::channel::{same_handle, ChannelError, SandboxHandle};
use crate::error::PluginError;
use crate::origin::OriginAllowlist;
use crate::protocol::{AckStatus, HostMessage, SandboxMessage, SandboxStatus};

// ─── Configuration ──────────────────────────────────────────────────────

/// Router configuration. The default allows no origins.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Origins permitted to send sandbox messages.
    pub allowed_origins: OriginAllowlist,
    /// Broker topics subscribed at start and mirrored to sandboxes.
    pub mirrored_topics: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            allowed_origins: OriginAllowlist::default(),
            mirrored_topics: known_topics(),
        }
    }
}

impl RouterConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            allowed_origins: OriginAllowlist::from_env(),
            mirrored_topics: known_topics(),
        }
    }
}

fn known_topics() -> Vec<String> {
    KNOWN_TOPICS
        .iter()
        .map(|(topic, _)| (*topic).to_string())
        .collect()
}

// ─── Statistics ─────────────────────────────────────────────────────────

/// Snapshot of the router's registry and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Number of live registrations.
    pub registrations: usize,
    /// Plugin id → number of topics it is subscribed to.
    pub topics: BTreeMap<String, usize>,
    /// Event envelopes handed to sandbox channels.
    pub delivered: u64,
    /// Registrations removed after a failed delivery.
    pub evicted: u64,
    /// Messages dropped because a sandbox queue was full.
    pub dropped: u64,
    /// Sandbox messages discarded for a disallowed origin.
    pub rejected_origins: u64,
}

// ─── Registration ───────────────────────────────────────────────────────

struct Registration {
    handle: SandboxHandle,
    /// Mirrored topics this sandbox wants delivered.
    topics: BTreeSet<String>,
}

enum Command {
    Incoming {
        raw: String,
        origin: String,
        source: SandboxHandle,
    },
    Broadcast {
        topic: String,
        event: Event,
    },
    Unmount {
        plugin_id: String,
    },
    HandleClosed {
        handle: SandboxHandle,
    },
    Stats(oneshot::Sender<RouterStats>),
}

// ─── Router handle ──────────────────────────────────────────────────────

/// Handle to the event router task.
pub struct EventRouter {
    commands: mpsc::UnboundedSender<Command>,
    mirrored: Mutex<Vec<Subscription>>,
    shutdown: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl EventRouter {
    /// Start the router and subscribe every mirrored topic on `broker`.
    pub fn start(broker: Arc<BrokerClient>, config: RouterConfig) -> Arc<Self> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let mirrored_topics: HashSet<String> = config.mirrored_topics.iter().cloned().collect();
        let mut mirrored = Vec::with_capacity(mirrored_topics.len());
        for topic in &mirrored_topics {
            let tx = commands_tx.clone();
            mirrored.push(broker.subscribe(topic.clone(), move |topic, event| {
                tx.send(Command::Broadcast {
                    topic: topic.to_string(),
                    event: event.clone(),
                })
                .map_err(|_| HandlerError::from("event router stopped"))
            }));
        }
        info!(
            topics = mirrored_topics.len(),
            origins = config.allowed_origins.len(),
            "event router started"
        );

        let state = RouterState {
            broker,
            allowlist: config.allowed_origins,
            mirrored: mirrored_topics,
            registrations: HashMap::new(),
            ready: HashMap::new(),
            last_status: None,
            stats: RouterStats::default(),
        };
        let join = tokio::spawn(state.run(commands_rx, shutdown.clone()));

        Arc::new(Self {
            commands: commands_tx,
            mirrored: Mutex::new(mirrored),
            shutdown,
            join: Mutex::new(Some(join)),
        })
    }

    /// Single entry point for sandbox-originated messages.
    ///
    /// `origin` is the transport-level origin of the sender and `source`
    /// the handle replies go to.
    pub fn handle_incoming_message(
        &self,
        raw: impl Into<String>,
        origin: &str,
        source: SandboxHandle,
    ) {
        self.enqueue(Command::Incoming {
            raw: raw.into(),
            origin: origin.to_string(),
            source,
        });
    }

    /// Deliver `event` to every sandbox subscribed to `topic`.
    pub fn broadcast_event(&self, topic: &str, event: Event) {
        self.enqueue(Command::Broadcast {
            topic: topic.to_string(),
            event,
        });
    }

    /// Remove a sandbox's registration on behalf of the host.
    pub fn unmount(&self, plugin_id: &str) {
        self.enqueue(Command::Unmount {
            plugin_id: plugin_id.to_string(),
        });
    }

    /// Remove every registration bound to `handle` once its transport is gone.
    pub fn channel_closed(&self, handle: &SandboxHandle) {
        self.enqueue(Command::HandleClosed {
            handle: Arc::clone(handle),
        });
    }

    pub async fn stats(&self) -> Result<RouterStats, PluginError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .map_err(|_| PluginError::RouterStopped)?;
        rx.await.map_err(|_| PluginError::RouterStopped)
    }

    /// Release the mirrored broker topics and stop the router task.
    pub async fn stop(&self) {
        let mirrored: Vec<Subscription> = self.mirrored.lock().unwrap().drain(..).collect();
        for subscription in mirrored {
            subscription.unsubscribe();
        }
        self.shutdown.cancel();
        let join = self.join.lock().unwrap().take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                tracing::error!("event router task failed: {e}");
            }
        }
    }

    fn enqueue(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("event router stopped, dropping command");
        }
    }
}

impl Drop for EventRouter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ─── Router task ────────────────────────────────────────────────────────

struct RouterState {
    broker: Arc<BrokerClient>,
    allowlist: OriginAllowlist,
    mirrored: HashSet<String>,
    /// Plugin id → registration.
    registrations: HashMap<String, Registration>,
    /// Plugin id → handle that already received its ready reply.
    ready: HashMap<String, SandboxHandle>,
    /// Latest connectivity event seen on the internal status topic.
    last_status: Option<Event>,
    stats: RouterStats,
}

impl RouterState {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) {
        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            match command {
                Command::Incoming {
                    raw,
                    origin,
                    source,
                } => self.on_incoming(&raw, &origin, source),
                Command::Broadcast { topic, event } => self.on_broadcast(&topic, &event),
                Command::Unmount { plugin_id } => {
                    if self.remove(&plugin_id) {
                        info!(plugin_id = %plugin_id, "sandbox unmounted");
                    }
                }
                Command::HandleClosed { handle } => self.on_handle_closed(&handle),
                Command::Stats(reply) => {
                    let _ = reply.send(self.snapshot());
                }
            }
        }
        info!(registrations = self.registrations.len(), "event router stopped");
    }

    fn on_incoming(&mut self, raw: &str, origin: &str, source: SandboxHandle) {
        if !self.allowlist.is_allowed(origin) {
            self.stats.rejected_origins += 1;
            warn!(origin = %origin, "discarding sandbox message from disallowed origin");
            return;
        }

        let message = match SandboxMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(origin = %origin, "ignoring malformed sandbox message: {e}");
                return;
            }
        };

        let plugin_id = message.plugin_id().to_string();
        if let Some(registration) = self.registrations.get(&plugin_id) {
            if !same_handle(&registration.handle, &source) {
                warn!(plugin_id = %plugin_id, "dropping message for a plugin bound to another handle");
                return;
            }
        }

        match message {
            SandboxMessage::Subscribe { topics, .. } => self.on_subscribe(&plugin_id, topics, source),
            SandboxMessage::Unsubscribe { topics, .. } => self.on_unsubscribe(&plugin_id, &topics),
            SandboxMessage::Status { status, .. } => self.on_status(&plugin_id, status, source),
        }
    }

    fn on_subscribe(&mut self, plugin_id: &str, topics: Vec<String>, source: SandboxHandle) {
        let (mirrored, unmirrored): (Vec<&String>, Vec<&String>) =
            topics.iter().partition(|topic| self.mirrored.contains(*topic));
        if !unmirrored.is_empty() {
            debug!(plugin_id = %plugin_id, topics = ?unmirrored, "subscribed to topics that are not mirrored");
        }

        if !mirrored.is_empty() {
            let registration = self
                .registrations
                .entry(plugin_id.to_string())
                .or_insert_with(|| {
                    info!(plugin_id = %plugin_id, "sandbox registered");
                    Registration {
                        handle: Arc::clone(&source),
                        topics: BTreeSet::new(),
                    }
                });
            registration
                .topics
                .extend(mirrored.into_iter().cloned());
            debug!(plugin_id = %plugin_id, topics = registration.topics.len(), "sandbox subscription updated");
        }

        let ack = HostMessage::SubscriptionConfirmed {
            topics,
            status: AckStatus::Success,
        };
        self.send(plugin_id, &source, ack);
    }

    fn on_unsubscribe(&mut self, plugin_id: &str, topics: &[String]) {
        let Some(registration) = self.registrations.get_mut(plugin_id) else {
            debug!(plugin_id = %plugin_id, "unsubscribe from unregistered sandbox ignored");
            return;
        };
        for topic in topics {
            registration.topics.remove(topic);
        }
        if registration.topics.is_empty() {
            self.registrations.remove(plugin_id);
            info!(plugin_id = %plugin_id, "sandbox has no remaining topics, registration removed");
        }
    }

    fn on_status(&mut self, plugin_id: &str, status: SandboxStatus, source: SandboxHandle) {
        match status {
            SandboxStatus::Ready => {
                let seen = self
                    .ready
                    .get(plugin_id)
                    .is_some_and(|handle| same_handle(handle, &source));
                if seen {
                    return;
                }
                let status = self.current_status();
                let message = HostMessage::event(CONNECTION_STATUS_TOPIC, &status, plugin_id);
                // A lost reply leaves the handle eligible for the next announce.
                if self.send(plugin_id, &source, message) {
                    self.ready.insert(plugin_id.to_string(), source);
                    debug!(plugin_id = %plugin_id, "sandbox ready");
                }
            }
            SandboxStatus::Error => {
                warn!(plugin_id = %plugin_id, "sandbox reported an error");
            }
            SandboxStatus::Disconnected => {
                if self.remove(plugin_id) {
                    info!(plugin_id = %plugin_id, "sandbox disconnected");
                }
            }
        }
    }

    fn on_broadcast(&mut self, topic: &str, event: &Event) {
        if topic == CONNECTION_STATUS_TOPIC {
            self.last_status = Some(event.clone());
        }

        let targets: Vec<(String, SandboxHandle)> = self
            .registrations
            .iter()
            .filter(|(_, registration)| registration.topics.contains(topic))
            .map(|(plugin_id, registration)| (plugin_id.clone(), Arc::clone(&registration.handle)))
            .collect();

        for (plugin_id, handle) in targets {
            let message = HostMessage::event(topic, event, &plugin_id);
            if self.send(&plugin_id, &handle, message) {
                self.stats.delivered += 1;
                debug!(plugin_id = %plugin_id, topic = %topic, "event delivered");
            }
        }
    }

    fn on_handle_closed(&mut self, handle: &SandboxHandle) {
        self.ready.retain(|_, ready| !same_handle(ready, handle));
        let before = self.registrations.len();
        self.registrations
            .retain(|_, registration| !same_handle(&registration.handle, handle));
        let removed = before - self.registrations.len();
        if removed > 0 {
            info!(removed, "sandbox channel closed, registrations removed");
        }
    }

    /// Send to one sandbox; evicts its registration when the handle is dead.
    fn send(&mut self, plugin_id: &str, handle: &SandboxHandle, message: HostMessage) -> bool {
        match handle.send(message) {
            Ok(()) => true,
            Err(ChannelError::Full) => {
                self.stats.dropped += 1;
                warn!(plugin_id = %plugin_id, "sandbox queue full, message dropped");
                false
            }
            Err(ChannelError::Closed) => {
                let bound = self
                    .registrations
                    .get(plugin_id)
                    .is_some_and(|registration| same_handle(&registration.handle, handle));
                if bound {
                    self.registrations.remove(plugin_id);
                    self.stats.evicted += 1;
                    warn!(plugin_id = %plugin_id, "sandbox channel closed, registration evicted");
                }
                self.ready.retain(|_, ready| !same_handle(ready, handle));
                false
            }
        }
    }

    fn remove(&mut self, plugin_id: &str) -> bool {
        self.ready.remove(plugin_id);
        self.registrations.remove(plugin_id).is_some()
    }

    fn current_status(&self) -> Event {
        match &self.last_status {
            Some(last) => Event::new(CONNECTION_STATUS_EVENT, last.data.clone()),
            None => Event::connection_status(self.broker.state(), 0, false),
        }
    }

    fn snapshot(&self) -> RouterStats {
        RouterStats {
            registrations: self.registrations.len(),
            topics: self
                .registrations
                .iter()
                .map(|(plugin_id, registration)| (plugin_id.clone(), registration.topics.len()))
                .collect(),
            ..self.stats.clone()
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
