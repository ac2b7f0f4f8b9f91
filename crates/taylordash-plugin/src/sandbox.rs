//! Sandbox client — the plugin-facing side of the event protocol.
//!
//! A plugin declares interest with [`SandboxClient::subscribe`] and receives
//! events through callbacks. The client announces itself with
//! `status: ready` on construction; until the host has answered with any
//! origin-valid message, subscribe requests are queued and replayed in
//! order.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use taylordash_broker::{run_isolated, Event, HandlerResult};

use crate::channel::HostChannel;
use crate::origin::OriginAllowlist;
use crate::protocol::{HostMessage, SandboxMessage, SandboxStatus};

/// Callback invoked with each delivered event.
pub type SandboxCallback = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;

#[derive(Default)]
struct ClientState {
    ready: bool,
    next_id: u64,
    /// Topic → callbacks in registration order.
    callbacks: HashMap<String, Vec<(u64, SandboxCallback)>>,
    /// Messages waiting for the host to become reachable.
    pending: Vec<SandboxMessage>,
    /// Topics the host has acknowledged.
    confirmed: BTreeSet<String>,
}

struct Shared {
    plugin_id: String,
    host: Arc<dyn HostChannel>,
    host_origins: OriginAllowlist,
    state: Mutex<ClientState>,
}

impl Shared {
    /// Send now, or queue until the handshake completes.
    fn post_or_queue(&self, message: SandboxMessage) {
        let message = {
            let mut state = self.state.lock().unwrap();
            if !state.ready {
                state.pending.push(message);
                return;
            }
            message
        };
        self.post(message);
    }

    fn post(&self, message: SandboxMessage) {
        if let Err(e) = self.host.post(message) {
            warn!(plugin_id = %self.plugin_id, "failed to post message to host: {e}");
        }
    }
}

/// Event client running inside one sandbox.
#[derive(Clone)]
pub struct SandboxClient {
    shared: Arc<Shared>,
}

impl SandboxClient {
    /// Create the client and announce readiness to the host.
    ///
    /// `host_origins` lists the origins host messages may come from.
    pub fn new(
        plugin_id: impl Into<String>,
        host: Arc<dyn HostChannel>,
        host_origins: OriginAllowlist,
    ) -> Self {
        let client = Self {
            shared: Arc::new(Shared {
                plugin_id: plugin_id.into(),
                host,
                host_origins,
                state: Mutex::new(ClientState::default()),
            }),
        };
        client.announce();
        client
    }

    pub fn plugin_id(&self) -> &str {
        &self.shared.plugin_id
    }

    /// Send `status: ready` again, e.g. after the host reloaded.
    pub fn announce(&self) {
        self.shared.post(SandboxMessage::Status {
            status: SandboxStatus::Ready,
            plugin_id: self.shared.plugin_id.clone(),
        });
    }

    /// Tell the host this sandbox is going away.
    pub fn disconnect(&self) {
        self.shared.post(SandboxMessage::Status {
            status: SandboxStatus::Disconnected,
            plugin_id: self.shared.plugin_id.clone(),
        });
    }

    pub fn is_ready(&self) -> bool {
        self.shared.state.lock().unwrap().ready
    }

    /// Topics acknowledged by the host so far.
    pub fn confirmed_topics(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .unwrap()
            .confirmed
            .iter()
            .cloned()
            .collect()
    }

    /// Register `callback` for every topic in `topics`.
    ///
    /// A `subscribe` message is sent for topics that had no callback yet.
    pub fn subscribe<I, S, F>(&self, topics: I, callback: F) -> SandboxSubscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        let callback: SandboxCallback = Arc::new(callback);
        let mut seen = HashSet::new();
        let topics: Vec<String> = topics
            .into_iter()
            .map(Into::into)
            .filter(|topic: &String| seen.insert(topic.clone()))
            .collect();

        let (id, fresh) = {
            let mut state = self.shared.state.lock().unwrap();
            state.next_id += 1;
            let id = state.next_id;
            let mut fresh = Vec::new();
            for topic in &topics {
                let entry = state.callbacks.entry(topic.clone()).or_default();
                if entry.is_empty() {
                    fresh.push(topic.clone());
                }
                entry.push((id, Arc::clone(&callback)));
            }
            (id, fresh)
        };

        if topics.is_empty() {
            warn!(plugin_id = %self.shared.plugin_id, "subscribe called without topics");
        } else if !fresh.is_empty() {
            self.shared.post_or_queue(SandboxMessage::Subscribe {
                topics: fresh,
                plugin_id: self.shared.plugin_id.clone(),
            });
        }

        SandboxSubscription {
            shared: Arc::clone(&self.shared),
            topics,
            id,
        }
    }

    /// Process one message from the host frame.
    ///
    /// Messages from origins outside the host allowlist are discarded
    /// before their content is looked at.
    pub fn handle_host_message(&self, raw: &str, origin: &str) {
        let shared = &self.shared;
        if !shared.host_origins.is_allowed(origin) {
            warn!(plugin_id = %shared.plugin_id, origin = %origin, "discarding host message from unexpected origin");
            return;
        }

        let message = match HostMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(plugin_id = %shared.plugin_id, "ignoring malformed host message: {e}");
                return;
            }
        };

        let flushed = {
            let mut state = shared.state.lock().unwrap();
            if state.ready {
                Vec::new()
            } else {
                state.ready = true;
                std::mem::take(&mut state.pending)
            }
        };
        if !flushed.is_empty() {
            debug!(plugin_id = %shared.plugin_id, count = flushed.len(), "host ready, replaying queued requests");
        }
        for pending in flushed {
            shared.post(pending);
        }

        match message {
            HostMessage::SubscriptionConfirmed { topics, .. } => {
                debug!(plugin_id = %shared.plugin_id, topics = ?topics, "subscription confirmed");
                shared.state.lock().unwrap().confirmed.extend(topics);
            }
            HostMessage::Event {
                data,
                topic,
                plugin_id,
                ..
            } => {
                if plugin_id != shared.plugin_id {
                    warn!(plugin_id = %shared.plugin_id, addressed_to = %plugin_id, "dropping event addressed to another plugin");
                    return;
                }
                let callbacks: Vec<SandboxCallback> = shared
                    .state
                    .lock()
                    .unwrap()
                    .callbacks
                    .get(&topic)
                    .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                    .unwrap_or_default();
                for callback in callbacks {
                    run_isolated(&shared.plugin_id, &topic, || callback(&data));
                }
            }
        }
    }
}

/// Callback registration returned by [`SandboxClient::subscribe`].
pub struct SandboxSubscription {
    shared: Arc<Shared>,
    topics: Vec<String>,
    id: u64,
}

impl SandboxSubscription {
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Remove this callback; topics left without callbacks are
    /// unsubscribed at the host.
    pub fn unsubscribe(self) {
        let emptied: Vec<String> = {
            let mut state = self.shared.state.lock().unwrap();
            let mut emptied = Vec::new();
            for topic in &self.topics {
                let Some(entry) = state.callbacks.get_mut(topic) else {
                    continue;
                };
                entry.retain(|(id, _)| *id != self.id);
                if entry.is_empty() {
                    state.callbacks.remove(topic);
                    state.confirmed.remove(topic);
                    emptied.push(topic.clone());
                }
            }
            emptied
        };

        if !emptied.is_empty() {
            self.shared.post_or_queue(SandboxMessage::Unsubscribe {
                topics: emptied,
                plugin_id: self.shared.plugin_id.clone(),
            });
        }
    }
}
