// src/domain/transceiver.rs

//! Transceiver abstraction.
//!
//! The transceiver sits between a session and the wire. It owns request
//! correlation, fragmentation to the MTU, reassembly, filtering and the
//! wait/timeout semantics of a request/response exchange. A session supplies
//! two things only: a [`TxRaw`] closure that publishes raw bytes, and every
//! inbound payload through [`Transceiver::dispatch_rsp`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{MgmtMsg, NmpHeader, Result};

/// Boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Raw outbound publish function handed to the transceiver.
///
/// Each call publishes one chunk and resolves once the broker acknowledged it.
pub type TxRaw = Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Rewrites (or rejects) an encoded frame before it is fragmented and sent.
pub type TxFilter = Arc<dyn Fn(Bytes) -> Result<Bytes> + Send + Sync>;

/// Rewrites (or rejects) a reassembled inbound frame before dispatch.
pub type RxFilter = Arc<dyn Fn(Bytes) -> Result<Bytes> + Send + Sync>;

/// Selects which unsolicited inbound frames a listener receives.
///
/// `None` fields match anything, so `MsgCriteria::default()` receives every
/// frame that is not a correlated response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MsgCriteria {
    pub group: Option<u16>,
    pub id: Option<u8>,
}

impl MsgCriteria {
    pub fn new(group: u16, id: u8) -> Self {
        Self {
            group: Some(group),
            id: Some(id),
        }
    }

    pub fn group(group: u16) -> Self {
        Self {
            group: Some(group),
            id: None,
        }
    }

    pub fn matches(&self, hdr: &NmpHeader) -> bool {
        self.group.map_or(true, |g| g == hdr.group) && self.id.map_or(true, |i| i == hdr.id)
    }
}

/// Receiving end of a registered listener.
///
/// Dropping the listener does not unregister it; call
/// [`unregister_listener`](crate::MqttSesn::unregister_listener). Frames
/// delivered after the receiver is dropped are discarded.
#[derive(Debug)]
pub struct Listener {
    criteria: MsgCriteria,
    inbox: mpsc::UnboundedReceiver<Result<MgmtMsg>>,
}

impl Listener {
    pub fn new(criteria: MsgCriteria, inbox: mpsc::UnboundedReceiver<Result<MgmtMsg>>) -> Self {
        Self { criteria, inbox }
    }

    pub fn criteria(&self) -> &MsgCriteria {
        &self.criteria
    }

    /// Next matching frame, or an error pushed by `abort_rx`/`close`.
    ///
    /// `None` once the listener has been unregistered and drained.
    pub async fn recv(&mut self) -> Option<Result<MgmtMsg>> {
        self.inbox.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Result<MgmtMsg>> {
        self.inbox.try_recv().ok()
    }
}

/// Request correlation and framing engine used by a session.
#[async_trait::async_trait]
pub trait Transceiver: Send + Sync {
    // ---
    /// Send `msg` through `tx_raw` in chunks of at most `mtu` bytes and wait
    /// for the correlated response.
    ///
    /// Fails with [`Error::Timeout`](crate::Error::Timeout) when nothing
    /// correlated arrives within `timeout`.
    async fn tx_rx_mgmt(
        &self,
        tx_raw: TxRaw,
        msg: MgmtMsg,
        mtu: usize,
        timeout: Duration,
    ) -> Result<MgmtMsg>;

    /// Send `msg` without waiting for any response.
    async fn tx_observe(&self, tx_raw: TxRaw, msg: MgmtMsg, mtu: usize) -> Result<()>;

    /// Entry point for every inbound payload on the session's subscription.
    fn dispatch_rsp(&self, payload: Bytes);

    /// Fail every pending wait and notify every listener with `err`.
    fn error_all(&self, err: crate::Error);

    /// Register a listener for unsolicited frames.
    fn listen(&self, criteria: MsgCriteria) -> Result<Listener>;

    /// Remove the listener registered with `criteria`, if any.
    fn stop_listen(&self, criteria: &MsgCriteria);

    /// Currently installed filters.
    fn filters(&self) -> (Option<TxFilter>, Option<RxFilter>);

    /// Replace both filters.
    fn set_filters(&self, tx: Option<TxFilter>, rx: Option<RxFilter>);
}

/// Shared transceiver pointer.
pub type TransceiverPtr = Arc<dyn Transceiver>;
