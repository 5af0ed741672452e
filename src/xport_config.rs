//! Transport configuration.
//!
//! [`XportConfig`] is built once (from code, a host configuration file, or a
//! connection string), handed to [`MqttXport`](crate::MqttXport) and shared
//! read-only with every session built from it.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ClientIdGen, Error, Result};

/// Largest frame the device side accepts in one broker message.
pub const MAX_PACKET_SIZE: usize = 256;

/// Management-protocol (NMP) header size.
pub const NMP_HDR_SIZE: usize = 8;

/// Worst-case overhead of the outer OMP/CoAP envelope around an NMP body.
pub const OMP_MSG_OVERHEAD: usize = 13;

/// Default inbound and outbound MTU.
pub const DEFAULT_MTU: usize = MAX_PACKET_SIZE - OMP_MSG_OVERHEAD - NMP_HDR_SIZE;

/// Default topic suffix the device publishes responses on.
pub const DEFAULT_RX_TOPIC: &str = "server_rx";

/// Default topic suffix requests are published on.
pub const DEFAULT_TX_TOPIC: &str = "server_tx";

/// Store locator meaning "keep broker-client state in memory only".
pub const MEMORY_STORE: &str = ":memory:";

/// Build a device topic: `"{id}/update/{device_id}/{suffix}"`.
pub fn build_topic(id: &str, device_id: u32, suffix: &str) -> String {
    format!("{id}/update/{device_id}/{suffix}")
}

/// MQTT delivery guarantee.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce = 0,
    #[default]
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl Qos {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<i64> for Qos {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(Error::InvalidQos(other.to_string())),
        }
    }
}

impl TryFrom<u8> for Qos {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Qos::try_from(i64::from(value))
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        qos.as_u8()
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Where the broker client keeps in-flight QoS 1/2 state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PersistenceStore {
    /// No durable store.
    #[default]
    Memory,
    /// File-backed store rooted at the given directory.
    File(PathBuf),
}

impl PersistenceStore {
    pub fn is_memory(&self) -> bool {
        matches!(self, PersistenceStore::Memory)
    }
}

impl From<String> for PersistenceStore {
    fn from(locator: String) -> Self {
        if locator.is_empty() || locator == MEMORY_STORE {
            PersistenceStore::Memory
        } else {
            PersistenceStore::File(PathBuf::from(locator))
        }
    }
}

impl From<&str> for PersistenceStore {
    fn from(locator: &str) -> Self {
        PersistenceStore::from(locator.to_string())
    }
}

impl From<PersistenceStore> for String {
    fn from(store: PersistenceStore) -> Self {
        match store {
            PersistenceStore::Memory => MEMORY_STORE.to_string(),
            PersistenceStore::File(path) => path.to_string_lossy().into_owned(),
        }
    }
}

/// Addressing, credential and policy parameters for an MQTT transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XportConfig {
    // ---
    /// Logical client identifier; also the first topic level.
    pub id: String,

    /// Broker address, e.g. `"tcp://localhost:1883"`.
    pub broker: String,

    /// Broker user name. Empty means no credentials.
    pub user: String,

    /// Broker password.
    pub password: String,

    /// QoS used for the inbound subscription and every outbound publish.
    pub qos: Qos,

    /// Numeric device identifier; the third topic level.
    pub device_id: u32,

    /// Inbound topic suffix (device → client).
    pub rx_topic: String,

    /// Outbound topic suffix (client → device).
    pub tx_topic: String,

    /// Largest inbound management frame.
    pub mtu_in: usize,

    /// Largest outbound chunk handed to the broker.
    pub mtu_out: usize,

    /// Broker-client persistence store.
    pub store: PersistenceStore,

    /// Ask the broker to discard any previous session state.
    pub clean_session: bool,

    /// Broker keep-alive interval in seconds.
    pub keep_alive_secs: u16,

    /// How long `open()` waits for the broker's CONNACK.
    pub connect_timeout_secs: u64,

    /// Suffix generator for the per-connection client id.
    #[serde(skip)]
    pub client_id_gen: ClientIdGen,
}

impl Default for XportConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            broker: String::new(),
            user: String::new(),
            password: String::new(),
            qos: Qos::AtLeastOnce,
            device_id: 0,
            rx_topic: DEFAULT_RX_TOPIC.to_string(),
            tx_topic: DEFAULT_TX_TOPIC.to_string(),
            mtu_in: DEFAULT_MTU,
            mtu_out: DEFAULT_MTU,
            store: PersistenceStore::Memory,
            clean_session: false,
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            client_id_gen: ClientIdGen::default(),
        }
    }
}

impl XportConfig {
    // ---

    /// Configuration for the given identifier and broker, defaults elsewhere.
    pub fn with_broker(id: impl Into<String>, broker: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            broker: broker.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_device_id(mut self, device_id: u32) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_topics(mut self, rx_topic: impl Into<String>, tx_topic: impl Into<String>) -> Self {
        self.rx_topic = rx_topic.into();
        self.tx_topic = tx_topic.into();
        self
    }

    pub fn with_mtu(mut self, mtu_in: usize, mtu_out: usize) -> Self {
        self.mtu_in = mtu_in;
        self.mtu_out = mtu_out;
        self
    }

    pub fn with_store(mut self, store: impl Into<PersistenceStore>) -> Self {
        self.store = store.into();
        self
    }

    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn with_keep_alive_secs(mut self, secs: u16) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Replace the client-id suffix generator.
    pub fn with_client_id_gen(mut self, gen: ClientIdGen) -> Self {
        self.client_id_gen = gen;
        self
    }

    /// Topic the session subscribes to.
    pub fn rx_topic_path(&self) -> String {
        build_topic(&self.id, self.device_id, &self.rx_topic)
    }

    /// Topic the session publishes to.
    pub fn tx_topic_path(&self) -> String {
        build_topic(&self.id, self.device_id, &self.tx_topic)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Check invariants that the type system does not already enforce.
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.id.is_empty() {
            return Err(Error::Config("client identifier is empty".into()));
        }
        if self.id.contains(['/', '+', '#']) {
            return Err(Error::Config(format!(
                "client identifier '{}' contains a topic separator or wildcard",
                self.id
            )));
        }
        if self.broker.is_empty() {
            return Err(Error::Config("broker address is empty".into()));
        }
        if self.mtu_in == 0 {
            return Err(Error::InvalidMtu(self.mtu_in.to_string()));
        }
        if self.mtu_out == 0 {
            return Err(Error::InvalidMtu(self.mtu_out.to_string()));
        }
        Ok(())
    }
}
