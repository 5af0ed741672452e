//! MQTT session.
//!
//! A session is one logical conversation with one device. `open()` connects
//! to the broker and subscribes to `{id}/update/{device_id}/{rx_topic}`;
//! every delivery on that subscription goes to the transceiver. Requests are
//! published to `{id}/update/{device_id}/{tx_topic}`.
//!
//! ```text
//!  caller ── transmit_receive ──► Transceiver ── TxRaw ──► Connection::publish
//!                                     ▲
//!  broker ── InboundHandler ── dispatch_rsp
//! ```
//!
//! # Lifecycle
//!
//! Closed → Open → Closed. A session that has been closed is retired and
//! cannot be reopened; build a new one from the transport.
//!
//! Open and close are serialised by an async lock held across the broker
//! round trips. The connection handle itself sits behind a short-lived
//! mutex so calls on other tasks never wait on a connect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::xport::XportState;
use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    log_error,
    log_info,
    log_warn,
    BoxFuture,
    BrokerClientPtr,
    ConnectOptions,
    ConnectionPtr,
    Delivery,
    Error,
    InboundHandler,
    Listener,
    MgmtMsg,
    MsgCriteria,
    Result,
    RxFilter,
    TransceiverPtr,
    TxFilter,
    TxRaw,
    XportConfig,
};

/// Linger allowed for outstanding acknowledgments on `close()`.
pub const CLOSE_LINGER: Duration = Duration::from_millis(250);

/// Linger allowed on the forced disconnect of `abort_rx()`.
pub const ABORT_LINGER: Duration = Duration::from_millis(100);

/// Management protocol carried by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MgmtProto {
    #[default]
    Nmp,
    Omp,
}

/// Per-session settings.
#[derive(Clone, Default)]
pub struct SesnConfig {
    pub mgmt_proto: MgmtProto,
    /// Applied to every outbound frame before fragmentation.
    pub tx_filter: Option<TxFilter>,
    /// Applied to every reassembled inbound frame.
    pub rx_filter: Option<RxFilter>,
}

impl SesnConfig {
    pub fn new(mgmt_proto: MgmtProto) -> Self {
        Self {
            mgmt_proto,
            ..Self::default()
        }
    }

    pub fn with_filters(mut self, tx: Option<TxFilter>, rx: Option<RxFilter>) -> Self {
        self.tx_filter = tx;
        self.rx_filter = rx;
        self
    }
}

impl std::fmt::Debug for SesnConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SesnConfig")
            .field("mgmt_proto", &self.mgmt_proto)
            .field("tx_filter", &self.tx_filter.is_some())
            .field("rx_filter", &self.rx_filter.is_some())
            .finish()
    }
}

struct SesnState {
    conn: Option<ConnectionPtr>,
    xport: Option<Weak<XportState>>,
    retired: bool,
}

struct SesnInner {
    // ---
    cfg: Arc<XportConfig>,
    mgmt_proto: MgmtProto,
    broker: BrokerClientPtr,
    txvr: TransceiverPtr,
    lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<SesnState>,
    dropped: Arc<AtomicU64>,
}

/// Handle to an MQTT session. Clones share the same session.
#[derive(Clone)]
pub struct MqttSesn {
    inner: Arc<SesnInner>,
}

impl MqttSesn {
    // ---

    pub(crate) fn new(
        cfg: Arc<XportConfig>,
        sesn_cfg: SesnConfig,
        broker: BrokerClientPtr,
        txvr: TransceiverPtr,
        xport: Weak<XportState>,
    ) -> Self {
        // ---
        Self {
            inner: Arc::new(SesnInner {
                cfg,
                mgmt_proto: sesn_cfg.mgmt_proto,
                broker,
                txvr,
                lifecycle: tokio::sync::Mutex::new(()),
                state: Mutex::new(SesnState {
                    conn: None,
                    xport: Some(xport),
                    retired: false,
                }),
                dropped: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SesnState> {
        lock_ignore_poison(&self.inner.state)
    }

    fn connection(&self) -> Result<ConnectionPtr> {
        self.state().conn.clone().ok_or(Error::SessionNotOpen)
    }

    /// Connect to the broker and subscribe to the inbound topic.
    ///
    /// A subscription failure disconnects again and fails the open; the
    /// session stays closed.
    pub async fn open(&self) -> Result<()> {
        // ---
        let _lifecycle = self.inner.lifecycle.lock().await;
        {
            let state = self.state();
            if state.conn.is_some() {
                return Err(Error::AlreadyOpen);
            }
            if state.retired {
                return Err(Error::SessionRetired);
            }
        }

        let cfg = &self.inner.cfg;
        let has_user = !cfg.user.is_empty();
        let opts = ConnectOptions {
            broker: cfg.broker.clone(),
            client_id: cfg.client_id_gen.client_id(&cfg.id),
            user: has_user.then(|| cfg.user.clone()),
            password: has_user.then(|| cfg.password.clone()),
            clean_session: cfg.clean_session,
            store: cfg.store.clone(),
            keep_alive: Duration::from_secs(cfg.keep_alive_secs.into()),
            connect_timeout: cfg.connect_timeout(),
        };

        let client_id = opts.client_id.clone();
        let conn = self.inner.broker.connect(opts).await.map_err(|err| {
            log_error!("{client_id}: connect to {} failed: {err}", cfg.broker);
            err
        })?;

        let rx_topic = cfg.rx_topic_path();
        if let Err(err) = conn.subscribe(&rx_topic, cfg.qos, self.inbound_handler()).await {
            log_error!("{client_id}: subscribe to {rx_topic} failed: {err}");
            if let Err(_err) = conn.disconnect(Duration::ZERO).await {
                log_warn!("{client_id}: disconnect after failed subscribe: {_err}");
            }
            return Err(err);
        }

        log_info!("{client_id}: session open, subscribed to {rx_topic} at QoS {}", cfg.qos);
        self.state().conn = Some(conn);
        Ok(())
    }

    /// Every delivery on the inbound topic goes to the transceiver, unless
    /// the connection already reports itself disconnected.
    fn inbound_handler(&self) -> InboundHandler {
        // ---
        let txvr = self.inner.txvr.clone();
        let dropped = self.inner.dropped.clone();

        Arc::new(move |delivery: Delivery| {
            if !delivery.connected {
                let _total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log_warn!(
                    "dropped {} bytes on {}: connection reports disconnected ({_total} dropped so far)",
                    delivery.payload.len(),
                    delivery.topic
                );
                return;
            }
            log_debug!("rx {} bytes on {}", delivery.payload.len(), delivery.topic);
            txvr.dispatch_rsp(delivery.payload);
        })
    }

    /// Disconnect and retire the session.
    ///
    /// Pending calls fail with [`Error::ConnectionClosed`]. A disconnect
    /// error is logged; the session ends up closed regardless.
    pub async fn close(&self) -> Result<()> {
        // ---
        let _lifecycle = self.inner.lifecycle.lock().await;
        let (conn, xport) = {
            let mut state = self.state();
            let conn = state.conn.take().ok_or(Error::NotOpen)?;
            state.retired = true;
            (conn, state.xport.take())
        };

        if let Err(_err) = conn.disconnect(CLOSE_LINGER).await {
            log_warn!("{}: disconnect failed: {_err}", conn.client_id());
        }
        self.inner.txvr.error_all(Error::ConnectionClosed);

        if let Some(xport) = xport.and_then(|weak| weak.upgrade()) {
            xport.on_session_closed();
        }

        log_info!("{}: session closed", conn.client_id());
        Ok(())
    }

    /// True while the session holds a broker connection.
    pub fn is_open(&self) -> bool {
        self.state().conn.is_some()
    }

    /// Client id of the current connection.
    pub fn client_id(&self) -> Option<String> {
        self.state().conn.as_ref().map(|c| c.client_id().to_string())
    }

    pub fn mtu_in(&self) -> usize {
        self.inner.cfg.mtu_in
    }

    pub fn mtu_out(&self) -> usize {
        self.inner.cfg.mtu_out
    }

    pub fn mgmt_proto(&self) -> MgmtProto {
        self.inner.mgmt_proto
    }

    /// Observe traffic is not stream-framed on this transport.
    pub fn is_tcp(&self) -> bool {
        false
    }

    /// Inbound deliveries dropped because the connection was down.
    pub fn dropped_deliveries(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &XportConfig {
        &self.inner.cfg
    }

    /// Publish closure bound to the current connection and the tx topic.
    fn tx_raw(&self) -> Result<TxRaw> {
        // ---
        let conn = self.connection()?;
        let topic: Arc<str> = Arc::from(self.inner.cfg.tx_topic_path());
        let qos = self.inner.cfg.qos;

        let tx_raw: TxRaw = Arc::new(move |chunk: Bytes| -> BoxFuture<'static, Result<()>> {
            let conn = conn.clone();
            let topic = topic.clone();
            Box::pin(async move {
                log_debug!("tx {} bytes on {topic}", chunk.len());
                conn.publish(&topic, qos, chunk).await
            })
        });
        Ok(tx_raw)
    }

    /// Send `msg` and wait for its correlated response.
    ///
    /// Fails with [`Error::SessionNotOpen`] before any I/O when closed, and
    /// with [`Error::Timeout`] when no response arrives in time.
    pub async fn transmit_receive(&self, msg: MgmtMsg, timeout: Duration) -> Result<MgmtMsg> {
        // ---
        let tx_raw = self.tx_raw()?;
        self.inner
            .txvr
            .tx_rx_mgmt(tx_raw, msg, self.mtu_out(), timeout)
            .await
    }

    /// Run [`transmit_receive`](Self::transmit_receive) on its own task.
    ///
    /// Returns as soon as the task is spawned. The response goes to
    /// `rsp_tx`, any error (including a closed session) to `err_tx`.
    pub fn transmit_receive_async(
        &self,
        msg: MgmtMsg,
        timeout: Duration,
        rsp_tx: mpsc::Sender<MgmtMsg>,
        err_tx: mpsc::Sender<Error>,
    ) -> Result<()> {
        // ---
        let sesn = self.clone();
        tokio::spawn(async move {
            let delivered = match sesn.transmit_receive(msg, timeout).await {
                Ok(rsp) => rsp_tx.send(rsp).await.is_ok(),
                Err(err) => err_tx.send(err).await.is_ok(),
            };
            if !delivered {
                log_debug!("async transmit outcome discarded: receiver gone");
            }
        });
        Ok(())
    }

    /// Fail every pending call with [`Error::Aborted`] and force a disconnect.
    ///
    /// Cancellation is session-wide; `_seq` is accepted but does not select
    /// a call. The connection handle is kept, so the session still counts as
    /// open and must be closed by the caller.
    pub async fn abort_rx(&self, _seq: u8) -> Result<()> {
        // ---
        let conn = self.connection()?;
        self.inner.txvr.error_all(Error::Aborted);

        if let Err(_err) = conn.disconnect(ABORT_LINGER).await {
            log_warn!("{}: disconnect on abort failed: {_err}", conn.client_id());
        }
        log_info!("{}: rx aborted", conn.client_id());
        Ok(())
    }

    /// Send `msg` without waiting for a response.
    pub async fn tx_observe(&self, msg: MgmtMsg) -> Result<()> {
        // ---
        let tx_raw = self.tx_raw()?;
        self.inner.txvr.tx_observe(tx_raw, msg, self.mtu_out()).await
    }

    /// Receive unsolicited frames matching `criteria`.
    pub fn register_listener(&self, criteria: MsgCriteria) -> Result<Listener> {
        self.inner.txvr.listen(criteria)
    }

    pub fn unregister_listener(&self, criteria: &MsgCriteria) {
        self.inner.txvr.stop_listen(criteria)
    }

    pub fn filters(&self) -> (Option<TxFilter>, Option<RxFilter>) {
        self.inner.txvr.filters()
    }

    pub fn set_filters(&self, tx: Option<TxFilter>, rx: Option<RxFilter>) {
        self.inner.txvr.set_filters(tx, rx)
    }

    /// Accepting inbound sessions is not offered by this transport.
    pub async fn rx_accept(&self) -> Result<(MqttSesn, SesnConfig)> {
        Err(Error::NotImplemented("rx_accept"))
    }

    /// Blocking observe receive is not offered; use a [`Listener`].
    pub async fn receive_observe(&self, _timeout: Duration) -> Result<MgmtMsg> {
        Err(Error::NotImplemented("receive_observe"))
    }
}

impl std::fmt::Debug for MqttSesn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSesn")
            .field("id", &self.inner.cfg.id)
            .field("device_id", &self.inner.cfg.device_id)
            .field("mgmt_proto", &self.inner.mgmt_proto)
            .field("open", &self.is_open())
            .finish()
    }
}
