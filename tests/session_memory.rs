// tests/session_memory.rs

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use common::{init_logging, Behaviour, Device};
use mgmt_mqtt::{
    // ---
    nmp::{NMP_OP_READ_RSP, NMP_OP_WRITE},
    ClientIdGen,
    Error,
    MemoryHub,
    MgmtMsg,
    MqttSesn,
    MqttXport,
    MsgCriteria,
    SesnConfig,
    TxFilter,
    XportConfig,
};

const RX_TOPIC: &str = "C1/update/0/server_rx";
const TX_TOPIC: &str = "C1/update/0/server_tx";

struct Fixture {
    hub: Arc<MemoryHub>,
    xport: MqttXport,
    sesn: MqttSesn,
    device: Device,
}

async fn fixture(behaviour: Behaviour) -> Fixture {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let cfg: XportConfig = "C1,tcp://localhost:1883,,,1,0".parse().expect("conn string");
    let device = Device::attach(&hub, &cfg, behaviour).await;

    let xport = MqttXport::with_broker(cfg, hub.broker()).expect("xport");
    xport.start().expect("start");

    let sesn = xport.build_session(SesnConfig::default());
    sesn.open().await.expect("open");

    Fixture {
        hub,
        xport,
        sesn,
        device,
    }
}

fn request(body: &[u8]) -> MgmtMsg {
    MgmtMsg::read(1, 0, body.to_vec()).unwrap()
}

#[tokio::test]
async fn test_open_subscribes_and_call_times_out() {
    // ---
    let f = fixture(Behaviour::Silent).await;

    assert!(f.hub.subscribed_topics().contains(&RX_TOPIC.to_string()));

    let req = request(b"ping");
    let result = f
        .sesn
        .transmit_receive(req.clone(), Duration::from_millis(100))
        .await;

    assert_eq!(result, Err(Error::Timeout));
    assert_eq!(f.hub.published(TX_TOPIC), vec![req.encode()]);

    f.device.detach().await;
}

#[tokio::test]
async fn test_round_trip_with_device() {
    // ---
    let f = fixture(Behaviour::Echo).await;

    let req = request(b"image list");
    let rsp = f
        .sesn
        .transmit_receive(req.clone(), Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(rsp.seq(), req.seq());
    assert_eq!(rsp.hdr.op, NMP_OP_READ_RSP);
    assert_eq!(rsp.body, req.body);

    f.sesn.close().await.unwrap();
    f.device.detach().await;
}

#[tokio::test]
async fn test_stray_payload_does_not_derail_later_calls() {
    // ---
    let f = fixture(Behaviour::Echo).await;

    // Anyone on the broker may publish to the session's rx topic.
    f.hub.inject(RX_TOPIC, Bytes::from_static(b"hi"));

    for i in 0..3u8 {
        let req = request(&[i; 4]);
        let rsp = f
            .sesn
            .transmit_receive(req.clone(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(rsp.seq(), req.seq());
        assert_eq!(rsp.body, req.body);
    }

    f.sesn.close().await.unwrap();
    f.device.detach().await;
}

#[tokio::test]
async fn test_large_request_is_fragmented_to_mtu() {
    // ---
    let f = fixture(Behaviour::Echo).await;

    let body: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
    let req = request(&body);

    let rsp = f
        .sesn
        .transmit_receive(req.clone(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(rsp.body.len(), 600);

    let chunks = f.hub.published(TX_TOPIC);
    assert_eq!(chunks.len(), 3);
    assert!(chunks.iter().all(|c| c.len() <= f.sesn.mtu_out()));
    assert_eq!(chunks.concat(), req.encode().to_vec());

    f.device.detach().await;
}

#[tokio::test]
async fn test_concurrent_calls_each_get_their_response() {
    // ---
    let f = fixture(Behaviour::Echo).await;

    let calls: Vec<_> = (0..4u8)
        .map(|i| {
            let sesn = f.sesn.clone();
            tokio::spawn(async move {
                let req = request(&[i; 3]);
                let rsp = sesn.transmit_receive(req.clone(), Duration::from_secs(2)).await;
                (req, rsp)
            })
        })
        .collect();

    for call in calls {
        let (req, rsp) = call.await.unwrap();
        let rsp = rsp.unwrap();
        assert_eq!(rsp.seq(), req.seq());
        assert_eq!(rsp.body, req.body);
    }

    f.device.detach().await;
}

#[tokio::test]
async fn test_abort_unblocks_pending_call() {
    // ---
    let f = fixture(Behaviour::Silent).await;
    let client_id = f.sesn.client_id().unwrap();

    let sesn = f.sesn.clone();
    let call = tokio::spawn(async move {
        sesn.transmit_receive(request(b"wait"), Duration::from_secs(30)).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    f.sesn.abort_rx(0).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .expect("aborted call still blocked")
        .unwrap();
    assert_eq!(result, Err(Error::Aborted));

    // The broker connection is gone but the session still holds its handle.
    assert!(!f.hub.connected_clients().contains(&client_id));
    assert!(f.sesn.is_open());
    f.sesn.close().await.unwrap();

    f.device.detach().await;
}

#[tokio::test]
async fn test_close_fails_pending_call_and_retires() {
    // ---
    let f = fixture(Behaviour::Silent).await;

    let sesn = f.sesn.clone();
    let call = tokio::spawn(async move {
        sesn.transmit_receive(request(b"wait"), Duration::from_secs(30)).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    f.sesn.close().await.unwrap();

    assert_eq!(call.await.unwrap(), Err(Error::ConnectionClosed));
    assert!(!f.xport.is_started());
    assert_eq!(f.sesn.open().await, Err(Error::SessionRetired));

    // A fresh session from the same transport works.
    f.xport.start().unwrap();
    let again = f.xport.build_session(SesnConfig::default());
    again.open().await.unwrap();
    again.close().await.unwrap();

    f.device.detach().await;
}

#[tokio::test]
async fn test_async_call_returns_immediately() {
    // ---
    let f = fixture(Behaviour::Echo).await;

    let (rsp_tx, mut rsp_rx) = mpsc::channel(1);
    let (err_tx, mut err_rx) = mpsc::channel(1);

    let req = request(b"async");
    f.sesn
        .transmit_receive_async(req.clone(), Duration::from_secs(2), rsp_tx.clone(), err_tx.clone())
        .unwrap();

    let rsp = tokio::time::timeout(Duration::from_secs(2), rsp_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rsp.seq(), req.seq());
    assert!(err_rx.try_recv().is_err());

    // Errors arrive on the error channel.
    f.sesn.close().await.unwrap();
    f.sesn
        .transmit_receive_async(request(b"late"), Duration::from_secs(1), rsp_tx, err_tx)
        .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(2), err_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(err, Error::SessionNotOpen);

    f.device.detach().await;
}

#[tokio::test]
async fn test_async_call_does_not_block_on_silent_device() {
    // ---
    let f = fixture(Behaviour::Silent).await;

    let (rsp_tx, _rsp_rx) = mpsc::channel(1);
    let (err_tx, mut err_rx) = mpsc::channel(1);

    let started = tokio::time::Instant::now();
    f.sesn
        .transmit_receive_async(request(b"x"), Duration::from_millis(300), rsp_tx, err_tx)
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(300));

    assert_eq!(err_rx.recv().await, Some(Error::Timeout));

    f.device.detach().await;
}

#[tokio::test]
async fn test_delivery_while_disconnected_is_dropped() {
    // ---
    let f = fixture(Behaviour::Silent).await;
    let client_id = f.sesn.client_id().unwrap();

    let sesn = f.sesn.clone();
    let req = request(b"lost");
    let rsp = MgmtMsg::response_to(&req, Bytes::from_static(b"late")).unwrap();
    let call = tokio::spawn(async move {
        sesn.transmit_receive(req, Duration::from_millis(300)).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(f.hub.interrupt(&client_id));
    f.hub.inject(RX_TOPIC, rsp.encode());

    assert_eq!(f.sesn.dropped_deliveries(), 1);
    assert_eq!(call.await.unwrap(), Err(Error::Timeout));

    f.device.detach().await;
}

#[tokio::test]
async fn test_listeners_receive_matching_unsolicited_frames() {
    // ---
    let f = fixture(Behaviour::Silent).await;

    let mut images = f.sesn.register_listener(MsgCriteria::group(1)).unwrap();
    let mut stats = f.sesn.register_listener(MsgCriteria::new(2, 4)).unwrap();
    assert_eq!(
        f.sesn.register_listener(MsgCriteria::group(1)).err(),
        Some(Error::ListenerExists)
    );

    let notify = MgmtMsg::new(NMP_OP_WRITE, 1, 0, 200, Bytes::from_static(b"state")).unwrap();
    f.hub.inject(RX_TOPIC, notify.encode());

    assert_eq!(images.recv().await, Some(Ok(notify)));
    assert!(stats.try_recv().is_none());

    // Observe requests go out without waiting.
    let obs = request(b"observe");
    f.sesn.tx_observe(obs.clone()).await.unwrap();
    assert_eq!(f.hub.published(TX_TOPIC), vec![obs.encode()]);

    // Abort reaches listeners too.
    f.sesn.abort_rx(0).await.unwrap();
    assert_eq!(stats.recv().await, Some(Err(Error::Aborted)));

    f.sesn.unregister_listener(&MsgCriteria::group(1));
    assert_eq!(images.recv().await, Some(Err(Error::Aborted)));
    assert_eq!(images.recv().await, None);

    f.device.detach().await;
}

#[tokio::test]
async fn test_tx_filter_rejection_surfaces() {
    // ---
    let f = fixture(Behaviour::Echo).await;

    let reject: TxFilter = Arc::new(|_frame| Err(Error::Filter("blocked".into())));
    f.sesn.set_filters(Some(reject), None);
    assert!(f.sesn.filters().0.is_some());

    let result = f
        .sesn
        .transmit_receive(request(b"nope"), Duration::from_secs(1))
        .await;
    assert_eq!(result, Err(Error::Filter("blocked".into())));
    assert!(f.hub.published(TX_TOPIC).is_empty());

    f.sesn.set_filters(None, None);
    f.sesn
        .transmit_receive(request(b"yes"), Duration::from_secs(2))
        .await
        .unwrap();

    f.device.detach().await;
}

#[tokio::test]
async fn test_injected_client_ids() {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let cfg = XportConfig::with_broker("C1", "tcp://localhost:1883")
        .with_client_id_gen(ClientIdGen::sequential(100));
    let xport = MqttXport::with_broker(cfg, hub.broker()).unwrap();
    xport.start().unwrap();

    let a = xport.build_session(SesnConfig::default());
    let b = xport.build_session(SesnConfig::default());
    a.open().await.unwrap();
    b.open().await.unwrap();

    assert_eq!(a.client_id().as_deref(), Some("C1100"));
    assert_eq!(b.client_id().as_deref(), Some("C1101"));
    assert_eq!(hub.connected_clients(), vec!["C1100".to_string(), "C1101".to_string()]);
}
