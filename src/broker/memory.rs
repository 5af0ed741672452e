//! In-memory broker.
//!
//! Pure in-process implementation of the domain-level [`BrokerClient`] and
//! [`Connection`] traits, used by the test-suite and by demos that have no
//! broker at hand. It is also the reference behaviour other broker clients
//! approximate.
//!
//! ## Reference semantics
//!
//! - Topics match by exact string equality; wildcards are not interpreted.
//! - Once `subscribe()` returns, later matching publishes reach the handler.
//! - Handlers run synchronously on the publisher's task, in subscription order.
//! - `publish()` resolves after every matching handler has run, whatever the QoS.
//! - Connecting with a client id that is already connected takes the id over:
//!   the older connection is marked disconnected, as an MQTT broker would.
//!
//! ## Test hooks
//!
//! A [`MemoryHub`] can refuse connections or subscriptions, interrupt a
//! client (it stays subscribed but reports itself disconnected), and report
//! connected clients, subscribed topics and per-topic publish history. The
//! history keeps the last [`HISTORY_LIMIT`] payloads of each topic.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;

use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    log_info,
    BrokerClient,
    BrokerClientPtr,
    ConnectOptions,
    Connection,
    ConnectionPtr,
    Delivery,
    Error,
    InboundHandler,
    Qos,
    Result,
};

/// Payloads kept per topic for [`MemoryHub::published`].
pub const HISTORY_LIMIT: usize = 1024;

struct Subscriber {
    client_id: String,
    connected: Arc<AtomicBool>,
    handler: InboundHandler,
}

#[derive(Default)]
struct HubState {
    subscriptions: HashMap<String, Vec<Subscriber>>,
    clients: HashMap<String, Arc<AtomicBool>>,
    history: HashMap<String, VecDeque<Bytes>>,
    refuse_connections: bool,
    refuse_subscriptions: bool,
}

/// Shared message bus standing in for a broker.
///
/// Every [`MemoryBroker`] created from the same hub sees the same topics.
/// Use one hub per test to keep parallel tests isolated.
#[derive(Default)]
pub struct MemoryHub {
    state: Mutex<HubState>,
}

impl MemoryHub {
    // ---

    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Broker client whose connections attach to this hub.
    pub fn broker(self: &Arc<Self>) -> BrokerClientPtr {
        Arc::new(MemoryBroker { hub: self.clone() })
    }

    /// Make subsequent `connect()` calls fail with [`Error::Connect`].
    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    /// Make subsequent `subscribe()` calls fail with [`Error::Subscribe`].
    pub fn refuse_subscriptions(&self, refuse: bool) {
        self.state().refuse_subscriptions = refuse;
    }

    /// Mark a client disconnected without removing its subscriptions.
    ///
    /// Deliveries keep reaching its handlers with `connected == false`.
    /// Returns false if the client is unknown.
    pub fn interrupt(&self, client_id: &str) -> bool {
        // ---
        match self.state().clients.get(client_id) {
            Some(flag) => {
                flag.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Client ids currently registered with the hub, sorted.
    pub fn connected_clients(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Topics with at least one subscriber, sorted.
    pub fn subscribed_topics(&self) -> Vec<String> {
        // ---
        let state = self.state();
        let mut topics: Vec<String> = state
            .subscriptions
            .iter()
            .filter(|(_, subs)| !subs.is_empty())
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Payloads published on `topic`, oldest first, up to [`HISTORY_LIMIT`].
    pub fn published(&self, topic: &str) -> Vec<Bytes> {
        self.state()
            .history
            .get(topic)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Publish from the broker side, without a client connection.
    pub fn inject(&self, topic: &str, payload: Bytes) {
        self.route(topic, payload);
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        lock_ignore_poison(&self.state)
    }

    fn connect(&self, opts: &ConnectOptions) -> Result<Arc<AtomicBool>> {
        // ---
        let mut state = self.state();
        if state.refuse_connections {
            return Err(Error::Connect(format!(
                "connection refused by {}",
                opts.broker
            )));
        }

        let flag = Arc::new(AtomicBool::new(true));
        if let Some(old) = state.clients.insert(opts.client_id.clone(), flag.clone()) {
            log_info!("memory hub: client id {} taken over", opts.client_id);
            old.store(false, Ordering::SeqCst);
        }
        Ok(flag)
    }

    fn subscribe(&self, client_id: &str, connected: &Arc<AtomicBool>, topic: &str, handler: InboundHandler) -> Result<()> {
        // ---
        let mut state = self.state();
        if state.refuse_subscriptions {
            return Err(Error::Subscribe(format!("broker refused subscription to {topic}")));
        }

        log_debug!("memory hub: {client_id} subscribed to {topic}");
        state
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                client_id: client_id.to_string(),
                connected: connected.clone(),
                handler,
            });
        Ok(())
    }

    /// Record and deliver one message. Handlers run outside the hub lock.
    fn route(&self, topic: &str, payload: Bytes) {
        // ---
        let targets: Vec<(InboundHandler, Arc<AtomicBool>)> = {
            let mut state = self.state();
            let history = state.history.entry(topic.to_string()).or_default();
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(payload.clone());

            state
                .subscriptions
                .get(topic)
                .map(|subs| {
                    subs.iter()
                        .map(|s| (s.handler.clone(), s.connected.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        let topic: Arc<str> = Arc::from(topic);
        for (handler, connected) in targets {
            handler(Delivery {
                topic: topic.clone(),
                payload: payload.clone(),
                connected: connected.load(Ordering::SeqCst),
            });
        }
    }

    fn disconnect(&self, client_id: &str, connected: &Arc<AtomicBool>) {
        // ---
        let mut state = self.state();

        for subs in state.subscriptions.values_mut() {
            subs.retain(|s| !(s.client_id == client_id && Arc::ptr_eq(&s.connected, connected)));
        }

        // Only forget the id if it still belongs to this connection.
        let owned = state
            .clients
            .get(client_id)
            .is_some_and(|flag| Arc::ptr_eq(flag, connected));
        if owned {
            state.clients.remove(client_id);
        }
    }
}

/// [`BrokerClient`] attaching connections to a [`MemoryHub`].
pub struct MemoryBroker {
    hub: Arc<MemoryHub>,
}

impl MemoryBroker {
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        Self { hub }
    }
}

#[async_trait::async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(&self, opts: ConnectOptions) -> Result<ConnectionPtr> {
        // ---
        let connected = self.hub.connect(&opts)?;
        log_debug!("memory hub: {} connected", opts.client_id);

        Ok(Arc::new(MemoryConnection {
            hub: self.hub.clone(),
            client_id: opts.client_id,
            connected,
        }))
    }
}

struct MemoryConnection {
    hub: Arc<MemoryHub>,
    client_id: String,
    connected: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    // ---

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, topic: &str, _qos: Qos, handler: InboundHandler) -> Result<()> {
        // ---
        if !self.is_connected() {
            return Err(Error::Subscribe(format!("{}: not connected", self.client_id)));
        }
        self.hub.subscribe(&self.client_id, &self.connected, topic, handler)
    }

    async fn publish(&self, topic: &str, _qos: Qos, payload: Bytes) -> Result<()> {
        // ---
        if !self.is_connected() {
            return Err(Error::Publish(format!("{}: not connected", self.client_id)));
        }
        self.hub.route(topic, payload);
        Ok(())
    }

    async fn disconnect(&self, _linger: Duration) -> Result<()> {
        // ---
        self.connected.store(false, Ordering::SeqCst);
        self.hub.disconnect(&self.client_id, &self.connected);
        Ok(())
    }
}
