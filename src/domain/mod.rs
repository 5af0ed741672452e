//! Domain layer public interface.
//!
//! Defines the two collaborator seams a session is written against: the
//! broker client (connect, subscribe, publish, disconnect) and the
//! transceiver (correlation, framing, listeners). Nothing here refers to a
//! concrete MQTT library.
//!
//! All consumers import symbols via this module, not from individual files.

mod broker;
mod transceiver;

// --- Broker domain re-exports ---

pub use broker::{
    //
    BrokerClient,
    BrokerClientPtr,
    ConnectOptions,
    Connection,
    ConnectionPtr,
    Delivery,
    InboundHandler,
};

// --- Transceiver domain re-exports ---

pub use transceiver::{
    //
    BoxFuture,
    Listener,
    MsgCriteria,
    RxFilter,
    Transceiver,
    TransceiverPtr,
    TxFilter,
    TxRaw,
};
