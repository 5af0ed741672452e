use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{
    // ---
    broker::default_broker_client,
    log_debug,
    log_info,
    log_warn,
    BrokerClientPtr,
    Error,
    MqttSesn,
    NmpTransceiver,
    Result,
    SesnConfig,
    TransceiverPtr,
    XportConfig,
};

/// Started/stopped bookkeeping shared with the sessions a transport builds.
///
/// Sessions hold only a weak reference and notify through
/// [`on_session_closed`](Self::on_session_closed); the flag itself is only
/// ever changed here.
#[derive(Debug, Default)]
pub(crate) struct XportState {
    started: AtomicBool,
}

impl XportState {
    // ---

    fn start(&self) -> Result<()> {
        self.started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| Error::AlreadyStarted)
    }

    fn stop(&self) -> Result<()> {
        self.started
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| Error::AlreadyStopped)
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// A session built from this transport was closed.
    pub(crate) fn on_session_closed(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            log_debug!("transport marked stopped after session close");
        }
    }
}

/// MQTT transport: holds the configuration and broker client, guards
/// start/stop, and builds sessions.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use mgmt_mqtt::{MgmtMsg, MqttXport, SesnConfig, XportConfig};
///
/// # async fn run() -> mgmt_mqtt::Result<()> {
/// let cfg: XportConfig = "C1,tcp://localhost:1883,,,1,0".parse()?;
/// let xport = MqttXport::new(cfg)?;
/// xport.start()?;
///
/// let sesn = xport.build_session(SesnConfig::default());
/// sesn.open().await?;
/// let rsp = sesn
///     .transmit_receive(MgmtMsg::read(1, 0, Vec::<u8>::new())?, Duration::from_secs(5))
///     .await?;
/// println!("{rsp:?}");
/// sesn.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct MqttXport {
    // ---
    cfg: Arc<XportConfig>,
    broker: BrokerClientPtr,
    state: Arc<XportState>,
}

impl MqttXport {
    // ---

    /// Transport using the network broker client compiled into this build.
    pub fn new(cfg: XportConfig) -> Result<Self> {
        Self::with_broker(cfg, default_broker_client()?)
    }

    /// Transport using the given broker client.
    pub fn with_broker(cfg: XportConfig, broker: BrokerClientPtr) -> Result<Self> {
        // ---
        cfg.validate()?;
        Ok(Self {
            cfg: Arc::new(cfg),
            broker,
            state: Arc::new(XportState::default()),
        })
    }

    pub fn start(&self) -> Result<()> {
        // ---
        self.state.start()?;
        log_info!("mqtt transport {} started ({})", self.cfg.id, self.cfg.broker);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        // ---
        self.state.stop()?;
        log_info!("mqtt transport {} stopped", self.cfg.id);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.state.is_started()
    }

    pub fn config(&self) -> &XportConfig {
        &self.cfg
    }

    /// New closed session with the default NMP transceiver.
    pub fn build_session(&self, sesn_cfg: SesnConfig) -> MqttSesn {
        // ---
        let txvr = NmpTransceiver::new(sesn_cfg.tx_filter.clone(), sesn_cfg.rx_filter.clone());
        self.build_session_with(sesn_cfg, Arc::new(txvr))
    }

    /// New closed session driving the given transceiver.
    pub fn build_session_with(&self, sesn_cfg: SesnConfig, txvr: TransceiverPtr) -> MqttSesn {
        // ---
        if !self.is_started() {
            log_warn!("building session on stopped transport {}", self.cfg.id);
        }
        MqttSesn::new(
            self.cfg.clone(),
            sesn_cfg,
            self.broker.clone(),
            txvr,
            Arc::downgrade(&self.state),
        )
    }

    /// Raw byte transmission is not offered; traffic goes through a session.
    pub fn send(&self, _data: &[u8]) -> Result<()> {
        Err(Error::Unsupported("raw send on MQTT transport"))
    }
}

impl std::fmt::Debug for MqttXport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttXport")
            .field("id", &self.cfg.id)
            .field("broker", &self.cfg.broker)
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::MemoryHub;

    fn xport() -> MqttXport {
        let cfg = XportConfig::with_broker("C1", "tcp://localhost:1883");
        MqttXport::with_broker(cfg, MemoryHub::new().broker()).unwrap()
    }

    #[test]
    fn test_start_stop_guard() {
        // ---
        let x = xport();
        assert!(!x.is_started());

        x.start().unwrap();
        assert_eq!(x.start(), Err(Error::AlreadyStarted));
        assert!(x.is_started());

        x.stop().unwrap();
        assert_eq!(x.stop(), Err(Error::AlreadyStopped));

        // Restartable after a stop.
        x.start().unwrap();
    }

    #[test]
    fn test_send_unsupported() {
        let x = xport();
        assert!(matches!(x.send(b"raw"), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        // ---
        let cfg = XportConfig::with_broker("", "tcp://localhost:1883");
        let result = MqttXport::with_broker(cfg, MemoryHub::new().broker());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_build_session_is_closed() {
        // ---
        let x = xport();
        x.start().unwrap();
        let sesn = x.build_session(SesnConfig::default());
        assert!(!sesn.is_open());
        assert!(x.is_started());
    }
}
