use thiserror::Error;

/// Errors produced by transports, sessions and their collaborators.
///
/// `Clone` because a single abort or close fans the same error out to every
/// pending waiter and listener on a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // --- configuration
    /// Connection string has the wrong number of comma-separated fields.
    #[error("wrong connection string format: expected 6 to 8 fields, found {found}")]
    FieldCount { found: usize },

    /// QoS field is not an integer in {0, 1, 2}.
    #[error("invalid QoS '{0}': must be 0, 1 or 2")]
    InvalidQos(String),

    /// Device id field is not a non-negative integer.
    #[error("invalid device id '{0}'")]
    InvalidDeviceId(String),

    /// MTU field is not a positive integer.
    #[error("invalid MTU '{0}'")]
    InvalidMtu(String),

    /// Any other configuration problem.
    #[error("configuration error: {0}")]
    Config(String),

    // --- lifecycle
    /// `start()` called on a transport that is already started.
    #[error("MQTT transport started twice")]
    AlreadyStarted,

    /// `stop()` called on a transport that is already stopped.
    #[error("MQTT transport stopped twice")]
    AlreadyStopped,

    /// `open()` called on a session that already holds a connection.
    #[error("attempt to open an already-open MQTT session")]
    AlreadyOpen,

    /// `close()` called on a session that holds no connection.
    #[error("attempt to close an unopened MQTT session")]
    NotOpen,

    /// A call that needs a live connection was made on a closed session.
    #[error("attempt to transmit over closed MQTT session")]
    SessionNotOpen,

    /// The session was closed once and cannot be reopened.
    #[error("MQTT session was closed and cannot be reopened")]
    SessionRetired,

    // --- capability
    /// The operation is not offered by this transport.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The operation exists in the session contract but is not implemented here.
    #[error("operation not implemented: {0}")]
    NotImplemented(&'static str),

    // --- broker
    /// Broker connection could not be established.
    #[error("broker connect failed: {0}")]
    Connect(String),

    /// Broker rejected or failed a subscription.
    #[error("broker subscribe failed: {0}")]
    Subscribe(String),

    /// Broker rejected or failed a publish.
    #[error("broker publish failed: {0}")]
    Publish(String),

    /// Broker client failure not covered above (actor gone, bad URL, ...).
    #[error("transport error: {0}")]
    Transport(String),

    // --- call outcome
    /// No correlated response arrived within the caller's timeout.
    #[error("request timed out")]
    Timeout,

    /// Pending receive was aborted through `abort_rx`.
    #[error("rx aborted")]
    Aborted,

    /// The session closed while the call was waiting.
    #[error("connection closed while waiting for response")]
    ConnectionClosed,

    // --- transceiver
    /// A tx or rx filter rejected a frame.
    #[error("message filter failed: {0}")]
    Filter(String),

    /// A listener with identical criteria is already registered.
    #[error("listener with the same criteria already registered")]
    ListenerExists,

    /// Frame could not be built or is inconsistent.
    #[error("bad frame: {0}")]
    Frame(String),
}

impl Error {
    /// True for errors that mean "no answer" rather than "bad answer".
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

/// Result type alias for transport and session operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_is_timeout() {
        assert!(Error::Timeout.is_timeout());
        assert!(!Error::Aborted.is_timeout());
        assert!(!Error::Transport("gone".into()).is_timeout());
    }
}
