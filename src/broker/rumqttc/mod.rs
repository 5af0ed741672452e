//! Broker client backed by `rumqttc`.
//!
//! Adapts the rumqttc `AsyncClient`/`EventLoop` pair to the domain-level
//! [`BrokerClient`](crate::BrokerClient) and [`Connection`](crate::Connection)
//! traits without leaking rumqttc types upward.
//!
//! # Features
//!
//! - One actor task per connection owns the `EventLoop`
//! - `connect()` waits for CONNACK, bounded by the configured connect timeout
//! - SUBACK confirmation before `subscribe()` returns
//! - `publish()` waits for PUBACK / PUBCOMP according to QoS
//! - Resubscribe after an automatic reconnect
//!
//! Enabled by the `broker_rumqttc` feature (on by default).

mod connection;

pub use connection::RumqttcBroker;
