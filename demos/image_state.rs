//! Image-state read against a device behind an MQTT broker.
//!
//! Without arguments a simulated device answers on an in-process hub:
//!
//! ```text
//! cargo run --example image_state
//! ```
//!
//! With a connection string the request goes to a real broker:
//!
//! ```text
//! cargo run --example image_state -- "12345,tcp://localhost:1883,,,1,0"
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use mgmt_mqtt::{
    // ---
    nmp::Reassembler,
    ConnectOptions,
    ConnectionPtr,
    Delivery,
    MemoryHub,
    MgmtMsg,
    MgmtProto,
    MqttXport,
    PersistenceStore,
    Result,
    SesnConfig,
    XportConfig,
};

const IMAGE_GROUP: u16 = 1;
const IMAGE_STATE_ID: u8 = 0;

/// Answers every image-state read with a canned body.
async fn spawn_device(hub: &Arc<MemoryHub>, cfg: &XportConfig) -> Result<ConnectionPtr> {
    // ---
    let conn = hub
        .broker()
        .connect(ConnectOptions {
            broker: cfg.broker.clone(),
            client_id: "demo-device".into(),
            user: None,
            password: None,
            clean_session: true,
            store: PersistenceStore::Memory,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(1),
        })
        .await?;

    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Bytes>();
    conn.subscribe(
        &cfg.tx_topic_path(),
        cfg.qos,
        Arc::new(move |d: Delivery| {
            let _ = chunk_tx.send(d.payload);
        }),
    )
    .await?;

    let responder = conn.clone();
    let rx_topic = cfg.rx_topic_path();
    let qos = cfg.qos;
    tokio::spawn(async move {
        let mut reassembler = Reassembler::new();
        while let Some(chunk) = chunk_rx.recv().await {
            for frame in reassembler.push(&chunk) {
                let Ok(req) = MgmtMsg::decode(frame) else { continue };
                let body = b"slot=0 version=1.2.0 hash=3f9c0e21 active confirmed".to_vec();
                if let Ok(rsp) = MgmtMsg::response_to(&req, body) {
                    let _ = responder.publish(&rx_topic, qos, rsp.encode()).await;
                }
            }
        }
    });

    Ok(conn)
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let xport = match std::env::args().nth(1) {
        Some(cs) => MqttXport::new(cs.parse()?)?,
        None => {
            let hub = MemoryHub::new();
            let cfg = XportConfig::with_broker("12345", "tcp://localhost:1883");
            spawn_device(&hub, &cfg).await?;
            MqttXport::with_broker(cfg, hub.broker())?
        }
    };
    xport.start()?;

    let sesn = xport.build_session(SesnConfig::new(MgmtProto::Nmp));
    sesn.open().await?;

    let req = MgmtMsg::read(IMAGE_GROUP, IMAGE_STATE_ID, Vec::<u8>::new())?;
    let result = sesn.transmit_receive(req, Duration::from_secs(10)).await;
    sesn.close().await?;

    let rsp = match result {
        Err(err) if err.is_timeout() => {
            eprintln!("device {} did not answer", xport.config().device_id);
            return Err(err);
        }
        other => other?,
    };
    println!(
        "Device sent back {} bytes: {}",
        rsp.body.len(),
        String::from_utf8_lossy(&rsp.body)
    );
    Ok(())
}
