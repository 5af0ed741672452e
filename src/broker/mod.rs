//! Broker client implementations.
//!
//! The in-memory hub is always available. The rumqttc-backed client is
//! compiled in with the `broker_rumqttc` feature.

mod memory;

#[cfg(feature = "broker_rumqttc")]
mod rumqttc;

pub use memory::{MemoryBroker, MemoryHub, HISTORY_LIMIT};

#[cfg(feature = "broker_rumqttc")]
pub use self::rumqttc::RumqttcBroker;

use crate::{BrokerClientPtr, Result};

/// The network broker client this build was compiled with.
///
/// Fails with [`Error::Unsupported`](crate::Error::Unsupported) when no
/// network client feature is enabled.
pub fn default_broker_client() -> Result<BrokerClientPtr> {
    // ---
    #[cfg(feature = "broker_rumqttc")]
    {
        Ok(std::sync::Arc::new(RumqttcBroker::new()))
    }

    #[cfg(not(feature = "broker_rumqttc"))]
    {
        Err(crate::Error::Unsupported(
            "no network broker client compiled in (enable `broker_rumqttc`)",
        ))
    }
}
