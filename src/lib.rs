//! Device-management sessions over an MQTT broker.
//!
//! A [`MqttXport`] holds the broker address, credentials, QoS and topic
//! layout; every [`MqttSesn`] it builds talks to one device over the topic
//! pair `{id}/update/{device_id}/{rx_topic|tx_topic}`. Request/response
//! correlation, fragmentation and listener fan-out are delegated to a
//! [`Transceiver`] ([`NmpTransceiver`] by default).
//!
//! The broker client is pluggable through [`BrokerClient`]: [`MemoryHub`]
//! provides an in-process broker for tests and demos, and the
//! `broker_rumqttc` feature (on by default) adds a network client.
//!

// Import all sub modules once...
mod broker;
mod client_id;
mod conn_string;
mod domain;
mod error;
mod macros;
mod mgmt;
mod sesn;
mod xport;
mod xport_config;

pub(crate) use macros::{log_debug, log_error, log_info, log_trace, log_warn};

use std::sync::{Mutex, MutexGuard};

/// Acquire a std mutex, ignoring poisoning.
///
/// No lock in this crate is held while running user callbacks, so a poisoned
/// lock can only come from a panic inside the crate; the guarded maps stay
/// structurally valid either way.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub use broker::{default_broker_client, MemoryBroker, MemoryHub, HISTORY_LIMIT};

#[cfg(feature = "broker_rumqttc")]
pub use broker::RumqttcBroker;

pub use client_id::{ClientIdGen, DEFAULT_SUFFIX_BOUND};
pub use conn_string::parse_conn_string;
pub use error::{Error, Result};
pub use mgmt::nmp::{self, MgmtMsg, NmpHeader};
pub use mgmt::NmpTransceiver;
pub use sesn::{MgmtProto, MqttSesn, SesnConfig, ABORT_LINGER, CLOSE_LINGER};
pub use xport::MqttXport;

pub use xport_config::{
    //
    build_topic,
    PersistenceStore,
    Qos,
    XportConfig,
    DEFAULT_MTU,
    DEFAULT_RX_TOPIC,
    DEFAULT_TX_TOPIC,
    MAX_PACKET_SIZE,
    MEMORY_STORE,
    NMP_HDR_SIZE,
    OMP_MSG_OVERHEAD,
};

// --- public re-exports
pub use domain::{
    //
    BoxFuture,
    BrokerClient,
    BrokerClientPtr,
    ConnectOptions,
    Connection,
    ConnectionPtr,
    Delivery,
    InboundHandler,
    Listener,
    MsgCriteria,
    RxFilter,
    Transceiver,
    TransceiverPtr,
    TxFilter,
    TxRaw,
};
