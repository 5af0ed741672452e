// tests/common/mod.rs
//
// Shared fixtures: logging init and a simulated device on a MemoryHub.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use mgmt_mqtt::{
    // ---
    nmp::Reassembler,
    ConnectOptions,
    ConnectionPtr,
    Delivery,
    MemoryHub,
    MgmtMsg,
    PersistenceStore,
    XportConfig,
};

/// How the simulated device reacts to requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Answer every request with its own body.
    Echo,
    /// Swallow requests.
    Silent,
}

/// A device attached to the hub on the far side of a session's topic pair.
pub struct Device {
    conn: ConnectionPtr,
    task: JoinHandle<()>,
}

impl Device {
    // ---

    pub async fn attach(hub: &Arc<MemoryHub>, cfg: &XportConfig, behaviour: Behaviour) -> Self {
        // ---
        let opts = ConnectOptions {
            broker: cfg.broker.clone(),
            client_id: format!("device-{}", cfg.device_id),
            user: None,
            password: None,
            clean_session: true,
            store: PersistenceStore::Memory,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(1),
        };
        let conn = hub.broker().connect(opts).await.expect("device connect");

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Bytes>();
        conn.subscribe(
            &cfg.tx_topic_path(),
            cfg.qos,
            Arc::new(move |d: Delivery| {
                let _ = chunk_tx.send(d.payload);
            }),
        )
        .await
        .expect("device subscribe");

        let responder = conn.clone();
        let rx_topic = cfg.rx_topic_path();
        let qos = cfg.qos;

        let task = tokio::spawn(async move {
            let mut reassembler = Reassembler::new();
            while let Some(chunk) = chunk_rx.recv().await {
                for frame in reassembler.push(&chunk) {
                    if behaviour == Behaviour::Silent {
                        continue;
                    }
                    let req = MgmtMsg::decode(frame).expect("device decode");
                    let rsp = MgmtMsg::response_to(&req, req.body.clone()).expect("device rsp");
                    responder
                        .publish(&rx_topic, qos, rsp.encode())
                        .await
                        .expect("device publish");
                }
            }
        });

        Self { conn, task }
    }

    pub async fn detach(self) {
        let _ = self.conn.disconnect(Duration::ZERO).await;
        self.task.abort();
    }
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
