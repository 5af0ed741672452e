//! rumqttc connection actor.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the rumqttc `EventLoop`.
//! - The actor hands publishes and subscribes to `AsyncClient` with the
//!   non-blocking `try_*` calls, polls the event loop, and invokes inbound
//!   handlers for incoming publishes.
//! - Callers talk to the actor through a command channel and wait on a
//!   oneshot for the outcome.
//!
//! ## Acknowledgments
//!
//! rumqttc reports packet ids only on the wire events, so the actor keeps
//! publish waiters in request order until `Outgoing::Publish(pkid)` assigns
//! an id. QoS 0 completes there; QoS 1 completes on PUBACK, QoS 2 on PUBCOMP.
//! An outgoing publish whose pkid is already in flight is a retransmit and
//! is not matched to a new waiter.
//!
//! SUBACK carries only a packet id as well, so subscribes are serialised:
//! at most one is pending at a time.
//!
//! ## Disconnect
//!
//! `disconnect(linger)` stops accepting commands, keeps polling until every
//! publish is acknowledged or the linger expires, then sends DISCONNECT.
//! Waiters still outstanding at that point fail with [`Error::Publish`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rumqttc::{
    //
    AsyncClient,
    ConnAck,
    ConnectReturnCode,
    ConnectionError,
    Event,
    EventLoop,
    MqttOptions,
    Outgoing,
    Packet,
    Publish,
    QoS,
    SubAck,
    SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_trace,
    log_warn,
    BrokerClient,
    ConnectOptions,
    Connection,
    ConnectionPtr,
    Delivery,
    Error,
    InboundHandler,
    PersistenceStore,
    Qos,
    Result,
};

const DEFAULT_PORT: u16 = 1883;
const CMD_CHANNEL_DEPTH: usize = 64;
const CLIENT_CHANNEL_DEPTH: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

type Responder = oneshot::Sender<Result<()>>;

fn to_rumqttc(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Split `tcp://host:port` (or `mqtt://`, or a bare `host:port`) into parts.
fn parse_broker_addr(broker: &str) -> Result<(String, u16)> {
    // ---
    let addr = match broker.split_once("://") {
        Some(("tcp" | "mqtt", rest)) => rest,
        Some((scheme, _)) => {
            return Err(Error::Connect(format!(
                "unsupported scheme {scheme}:// in broker address {broker}"
            )))
        }
        None => broker,
    };

    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|err| {
                Error::Connect(format!("invalid port in broker address {broker}: {err}"))
            })?;
            (host, port)
        }
        None => (addr, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(Error::Connect(format!("missing host in broker address {broker}")));
    }
    Ok((host.to_string(), port))
}

/// Broker client that opens one rumqttc connection per `connect()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttcBroker;

impl RumqttcBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl BrokerClient for RumqttcBroker {
    async fn connect(&self, opts: ConnectOptions) -> Result<ConnectionPtr> {
        // ---
        let (host, port) = parse_broker_addr(&opts.broker)?;

        let mut mqtt = MqttOptions::new(opts.client_id.clone(), host, port);
        mqtt.set_keep_alive(opts.keep_alive);
        mqtt.set_clean_session(opts.clean_session);
        if let Some(user) = &opts.user {
            mqtt.set_credentials(user.clone(), opts.password.clone().unwrap_or_default());
        }
        if let PersistenceStore::File(path) = &opts.store {
            log_warn!(
                "{}: file store {} not supported by rumqttc, in-flight state stays in memory",
                opts.client_id,
                path.display()
            );
        }

        let (client, event_loop) = AsyncClient::new(mqtt, CLIENT_CHANNEL_DEPTH);
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel();
        let connected = Arc::new(AtomicBool::new(false));

        let actor = MqttActor {
            client_id: opts.client_id.clone(),
            client,
            event_loop,
            cmd_rx,
            connected: connected.clone(),
            ready: Some(ready_tx),
            reconnect: false,
            subscriptions: HashMap::new(),
            pending_subscribe: None,
            unsent: VecDeque::new(),
            inflight: HashMap::new(),
            closing: None,
        };
        let task = tokio::spawn(actor.run());

        match time::timeout(opts.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(Arc::new(RumqttcConnection {
                client_id: opts.client_id,
                cmd_tx,
                connected,
                task: Mutex::new(Some(task)),
            })),
            Ok(Ok(Err(err))) => {
                let _ = task.await;
                Err(err)
            }
            Ok(Err(_)) => Err(Error::Connect(format!(
                "{}: connection actor stopped",
                opts.client_id
            ))),
            Err(_) => {
                task.abort();
                Err(Error::Connect(format!(
                    "no CONNACK from {} within {:?}",
                    opts.broker, opts.connect_timeout
                )))
            }
        }
    }
}

//
// Actor commands
//

enum Cmd {
    //
    Publish {
        topic: String,
        qos: Qos,
        payload: Bytes,
        resp: Responder,
    },
    Subscribe {
        topic: String,
        qos: Qos,
        handler: InboundHandler,
        resp: Responder,
    },
    Disconnect {
        linger: Duration,
        resp: Responder,
    },
}

enum ActorStep {
    //
    Continue,
    Stop,
}

impl Cmd {
    // ---

    fn handle(self, actor: &mut MqttActor) -> ActorStep {
        // ---
        match self {
            Cmd::Publish {
                topic,
                qos,
                payload,
                resp,
            } => {
                actor.handle_publish(topic, qos, payload, resp);
                ActorStep::Continue
            }
            Cmd::Subscribe {
                topic,
                qos,
                handler,
                resp,
            } => {
                actor.handle_subscribe(topic, qos, handler, resp);
                ActorStep::Continue
            }
            Cmd::Disconnect { linger, resp } => {
                actor.closing = Some((Instant::now() + linger, resp));
                if actor.connected.load(Ordering::SeqCst) {
                    ActorStep::Continue
                } else {
                    ActorStep::Stop
                }
            }
        }
    }
}

struct PendingSubscribe {
    topic: String,
    qos: Qos,
    handler: InboundHandler,
    resp: Responder,
}

struct MqttActor {
    // ---
    client_id: String,
    client: AsyncClient,
    event_loop: EventLoop,
    cmd_rx: mpsc::Receiver<Cmd>,
    connected: Arc<AtomicBool>,
    ready: Option<Responder>,
    reconnect: bool,
    subscriptions: HashMap<String, (Qos, InboundHandler)>,
    pending_subscribe: Option<PendingSubscribe>,
    unsent: VecDeque<(Qos, Responder)>,
    inflight: HashMap<u16, Responder>,
    closing: Option<(Instant, Responder)>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl MqttActor {
    // ---

    async fn run(mut self) {
        // ---
        loop {
            let deadline = self.closing.as_ref().map(|(deadline, _)| *deadline);
            if let Some(deadline) = deadline {
                let drained = self.unsent.is_empty() && self.inflight.is_empty();
                if drained || Instant::now() >= deadline {
                    break;
                }
            }

            tokio::select! {
                cmd = self.cmd_rx.recv(), if deadline.is_none() => {
                    match cmd {
                        Some(cmd) => {
                            if matches!(cmd.handle(&mut self), ActorStep::Stop) {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                event = self.event_loop.poll() => {
                    if matches!(self.handle_event(event).await, ActorStep::Stop) {
                        break;
                    }
                }

                _ = sleep_until_opt(deadline) => {}
            }
        }

        self.shutdown().await;
    }

    async fn handle_event(&mut self, event: std::result::Result<Event, ConnectionError>) -> ActorStep {
        // ---
        match event {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => return self.handle_connack(connack),
            Ok(Event::Incoming(Packet::Publish(publish))) => self.handle_incoming(publish),
            Ok(Event::Incoming(Packet::SubAck(suback))) => self.handle_suback(suback),
            Ok(Event::Incoming(Packet::PubAck(ack))) => self.complete(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => self.complete(comp.pkid),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => self.handle_outgoing_publish(pkid),
            Ok(_event) => {
                log_trace!("{}: mqtt event (ignored): {:?}", self.client_id, _event);
            }
            Err(err) => {
                self.connected.store(false, Ordering::SeqCst);

                if let Some(ready) = self.ready.take() {
                    log_error!("{}: connect failed: {err}", self.client_id);
                    let _ = ready.send(Err(Error::Connect(err.to_string())));
                    return ActorStep::Stop;
                }
                if self.closing.is_some() {
                    return ActorStep::Stop;
                }

                log_error!("{}: broker connection lost: {err}", self.client_id);
                self.reconnect = true;
                if let Some(pending) = self.pending_subscribe.take() {
                    let _ = pending.resp.send(Err(Error::Subscribe(format!(
                        "connection lost before SUBACK for {}",
                        pending.topic
                    ))));
                }
                time::sleep(RECONNECT_DELAY).await;
            }
        }
        ActorStep::Continue
    }

    fn handle_connack(&mut self, connack: ConnAck) -> ActorStep {
        // ---
        if connack.code != ConnectReturnCode::Success {
            log_error!("{}: connection refused: {:?}", self.client_id, connack.code);
            self.connected.store(false, Ordering::SeqCst);
            if let Some(ready) = self.ready.take() {
                let _ = ready.send(Err(Error::Connect(format!("{:?}", connack.code))));
                return ActorStep::Stop;
            }
            return ActorStep::Continue;
        }

        log_info!("{}: connected to broker", self.client_id);
        self.connected.store(true, Ordering::SeqCst);

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Ok(()));
        } else if self.reconnect {
            self.reconnect = false;
            for (topic, (qos, _)) in &self.subscriptions {
                match self.client.try_subscribe(topic.as_str(), to_rumqttc(*qos)) {
                    Ok(()) => log_info!("{}: resubscribed to {topic}", self.client_id),
                    Err(err) => {
                        log_error!("{}: resubscribe failed for {topic}: {err}", self.client_id)
                    }
                }
            }
        }
        ActorStep::Continue
    }

    fn handle_publish(&mut self, topic: String, qos: Qos, payload: Bytes, resp: Responder) {
        // ---
        if !self.connected.load(Ordering::SeqCst) {
            let _ = resp.send(Err(Error::Publish(format!("{}: not connected", self.client_id))));
            return;
        }

        match self
            .client
            .try_publish(topic.as_str(), to_rumqttc(qos), false, payload.to_vec())
        {
            Ok(()) => self.unsent.push_back((qos, resp)),
            Err(err) => {
                log_error!("{}: publish to {topic} failed: {err}", self.client_id);
                let _ = resp.send(Err(Error::Publish(err.to_string())));
            }
        }
    }

    fn handle_outgoing_publish(&mut self, pkid: u16) {
        // ---
        if pkid != 0 && self.inflight.contains_key(&pkid) {
            log_trace!("{}: retransmit of pkid {pkid}", self.client_id);
            return;
        }

        match self.unsent.pop_front() {
            Some((Qos::AtMostOnce, resp)) => {
                let _ = resp.send(Ok(()));
            }
            Some((_, resp)) => {
                self.inflight.insert(pkid, resp);
            }
            None => log_trace!("{}: untracked outgoing publish {pkid}", self.client_id),
        }
    }

    fn complete(&mut self, pkid: u16) {
        if let Some(resp) = self.inflight.remove(&pkid) {
            let _ = resp.send(Ok(()));
        }
    }

    fn handle_subscribe(&mut self, topic: String, qos: Qos, handler: InboundHandler, resp: Responder) {
        // ---
        if !self.connected.load(Ordering::SeqCst) {
            let _ = resp.send(Err(Error::Subscribe(format!("{}: not connected", self.client_id))));
            return;
        }
        if self.pending_subscribe.is_some() {
            log_error!("{}: concurrent subscribe while one is pending", self.client_id);
            let _ = resp.send(Err(Error::Subscribe(format!(
                "another subscribe is pending, cannot subscribe to {topic}"
            ))));
            return;
        }

        if let Err(err) = self.client.try_subscribe(topic.as_str(), to_rumqttc(qos)) {
            log_error!("{}: failed to send subscribe for {topic}: {err}", self.client_id);
            let _ = resp.send(Err(Error::Subscribe(err.to_string())));
            return;
        }

        self.pending_subscribe = Some(PendingSubscribe {
            topic,
            qos,
            handler,
            resp,
        });
    }

    fn handle_suback(&mut self, suback: SubAck) {
        // ---
        let Some(pending) = self.pending_subscribe.take() else {
            log_debug!("{}: SUBACK for reconnect resubscribe", self.client_id);
            return;
        };

        let success = suback
            .return_codes
            .iter()
            .all(|code| !matches!(code, SubscribeReasonCode::Failure));

        if success {
            log_info!("{}: subscribed to {}", self.client_id, pending.topic);
            self.subscriptions
                .insert(pending.topic, (pending.qos, pending.handler));
            let _ = pending.resp.send(Ok(()));
        } else {
            log_error!(
                "{}: subscription to {} rejected: {:?}",
                self.client_id,
                pending.topic,
                suback.return_codes
            );
            let _ = pending.resp.send(Err(Error::Subscribe(format!(
                "broker rejected subscription to {}",
                pending.topic
            ))));
        }
    }

    fn handle_incoming(&self, publish: Publish) {
        // ---
        let Some((_, handler)) = self.subscriptions.get(publish.topic.as_str()) else {
            log_debug!("{}: publish on unsubscribed topic {}", self.client_id, publish.topic);
            return;
        };

        handler(Delivery {
            topic: Arc::from(publish.topic.as_str()),
            payload: publish.payload,
            connected: self.connected.load(Ordering::SeqCst),
        });
    }

    async fn shutdown(mut self) {
        // ---
        if self.connected.swap(false, Ordering::SeqCst) && self.client.try_disconnect().is_ok() {
            let event_loop = &mut self.event_loop;
            let flush = async {
                loop {
                    match event_loop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            };
            if time::timeout(DISCONNECT_FLUSH, flush).await.is_err() {
                log_warn!("{}: DISCONNECT not flushed in time", self.client_id);
            }
        }

        let lost = self.unsent.len() + self.inflight.len();
        if lost > 0 {
            log_warn!("{}: {lost} publish(es) unacknowledged at disconnect", self.client_id);
        }
        let err = Error::Publish("disconnected before acknowledgment".to_string());
        for (_, resp) in self.unsent.drain(..) {
            let _ = resp.send(Err(err.clone()));
        }
        for (_, resp) in self.inflight.drain() {
            let _ = resp.send(Err(err.clone()));
        }
        if let Some(pending) = self.pending_subscribe.take() {
            let _ = pending.resp.send(Err(Error::Subscribe("disconnected".to_string())));
        }
        if let Some((_, resp)) = self.closing.take() {
            let _ = resp.send(Ok(()));
        }

        log_info!("{}: disconnected", self.client_id);
    }
} // MqttActor

struct RumqttcConnection {
    // ---
    client_id: String,
    cmd_tx: mpsc::Sender<Cmd>,
    connected: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttcConnection {
    fn stopped(&self) -> String {
        format!("{}: connection actor stopped", self.client_id)
    }
}

#[async_trait::async_trait]
impl Connection for RumqttcConnection {
    // ---

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, topic: &str, qos: Qos, handler: InboundHandler) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Subscribe {
                topic: topic.to_string(),
                qos,
                handler,
                resp: tx,
            })
            .await
            .map_err(|_| Error::Subscribe(self.stopped()))?;

        rx.await.map_err(|_| Error::Subscribe(self.stopped()))?
    }

    async fn publish(&self, topic: &str, qos: Qos, payload: Bytes) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Publish {
                topic: topic.to_string(),
                qos,
                payload,
                resp: tx,
            })
            .await
            .map_err(|_| Error::Publish(self.stopped()))?;

        rx.await.map_err(|_| Error::Publish(self.stopped()))?
    }

    async fn disconnect(&self, linger: Duration) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Cmd::Disconnect { linger, resp: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.await.map_err(|err| {
                Error::Transport(format!("{}: connection actor failed: {err}", self.client_id))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_parse_broker_addr() {
        // ---
        assert_eq!(
            parse_broker_addr("tcp://localhost:1883").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_addr("mqtt://10.0.0.7:8883").unwrap(),
            ("10.0.0.7".to_string(), 8883)
        );
        assert_eq!(
            parse_broker_addr("broker.local").unwrap(),
            ("broker.local".to_string(), DEFAULT_PORT)
        );
    }

    #[test]
    fn test_parse_broker_addr_rejects() {
        // ---
        assert!(matches!(parse_broker_addr("ssl://h:8883"), Err(Error::Connect(_))));
        assert!(matches!(parse_broker_addr("tcp://h:port"), Err(Error::Connect(_))));
        assert!(matches!(parse_broker_addr("tcp://:1883"), Err(Error::Connect(_))));
    }

    #[tokio::test]
    async fn test_connect_refused_is_an_error() {
        // ---
        let opts = ConnectOptions {
            broker: "tcp://127.0.0.1:1".into(),
            client_id: "refused-1".into(),
            user: None,
            password: None,
            clean_session: true,
            store: PersistenceStore::Memory,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        };

        let result = RumqttcBroker::new().connect(opts).await;
        assert!(matches!(result, Err(Error::Connect(_))));
    }
}
