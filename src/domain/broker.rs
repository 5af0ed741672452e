// src/domain/broker.rs

//! Broker-client abstractions.
//!
//! A session needs very little from a publish/subscribe client: connect with
//! a set of options, subscribe one topic with a callback, publish raw bytes,
//! and disconnect. These traits capture exactly that, so sessions stay
//! independent of the concrete MQTT library.
//!
//! TCP connect/reconnect, TLS and wire-level delivery belong to the
//! implementation. Concrete clients live under `src/broker/`; the in-memory
//! client defines the reference semantics.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::{PersistenceStore, Qos, Result};

/// Everything a broker client needs to establish one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Broker address, e.g. `"tcp://localhost:1883"`.
    pub broker: String,
    /// Client id presented to the broker (already suffixed).
    pub client_id: String,
    /// User name; `None` sends no credentials.
    pub user: Option<String>,
    /// Password, sent only together with a user name.
    pub password: Option<String>,
    /// Discard broker-side session state on connect.
    pub clean_session: bool,
    /// In-flight message store.
    pub store: PersistenceStore,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Upper bound on waiting for the broker's CONNACK.
    pub connect_timeout: Duration,
}

/// One message delivered on a subscribed topic.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Topic the message arrived on.
    pub topic: Arc<str>,
    /// Raw payload.
    pub payload: Bytes,
    /// Whether the connection reported itself connected at delivery time.
    pub connected: bool,
}

/// Callback invoked for every delivery on a subscription.
///
/// Runs on the broker client's own task, concurrently with any caller
/// currently awaiting a response. Must not block.
pub type InboundHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// A live broker connection.
///
/// Implementations must ensure that:
/// - once `subscribe()` returns `Ok`, later matching publishes reach the handler;
/// - `publish()` resolves only after the broker acknowledged at the requested QoS
///   (QoS 0: once the packet has been handed to the network);
/// - `disconnect()` is idempotent.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    // ---
    /// Client id this connection was opened with.
    fn client_id(&self) -> &str;

    /// Current connection state as seen by the client library.
    fn is_connected(&self) -> bool;

    /// Subscribe to an exact topic. Resolves once the broker acknowledged.
    async fn subscribe(&self, topic: &str, qos: Qos, handler: InboundHandler) -> Result<()>;

    /// Publish raw bytes. Resolves once acknowledged per `qos`.
    async fn publish(&self, topic: &str, qos: Qos, payload: Bytes) -> Result<()>;

    /// Disconnect, allowing up to `linger` for outstanding acknowledgments.
    async fn disconnect(&self, linger: Duration) -> Result<()>;
}

/// Shared connection pointer.
pub type ConnectionPtr = Arc<dyn Connection>;

/// Factory for broker connections.
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    /// Connect and wait for the broker to accept the connection.
    ///
    /// Failures are reported as [`Error::Connect`](crate::Error::Connect);
    /// implementations never abort the process.
    async fn connect(&self, opts: ConnectOptions) -> Result<ConnectionPtr>;
}

/// Shared broker-client pointer.
pub type BrokerClientPtr = Arc<dyn BrokerClient>;
