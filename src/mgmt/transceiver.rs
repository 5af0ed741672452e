//! Default NMP transceiver.
//!
//! Correlates responses to requests by NMP sequence number, fragments
//! outbound frames to the session MTU, reassembles inbound chunks, applies
//! the session's tx/rx filters and fans unsolicited frames out to listeners.
//!
//! # Concurrency
//!
//! Any number of `tx_rx_mgmt` calls may be in flight at once provided their
//! sequence numbers differ. State lives behind one mutex that is never held
//! across an await point or while running a user filter.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time;

use super::nmp::{fragment, Reassembler};
use super::pending::PendingRequests;
use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    log_trace,
    log_warn,
    Error,
    Listener,
    MgmtMsg,
    MsgCriteria,
    Result,
    RxFilter,
    Transceiver,
    TxFilter,
    TxRaw,
};

type ListenerMap = HashMap<MsgCriteria, mpsc::UnboundedSender<Result<MgmtMsg>>>;

struct State {
    pending: PendingRequests,
    listeners: ListenerMap,
    reassembler: Reassembler,
    tx_filter: Option<TxFilter>,
    rx_filter: Option<RxFilter>,
}

/// Sequence-correlating transceiver for NMP frames.
pub struct NmpTransceiver {
    state: Mutex<State>,
}

impl NmpTransceiver {
    // ---

    pub fn new(tx_filter: Option<TxFilter>, rx_filter: Option<RxFilter>) -> Self {
        // ---
        Self {
            state: Mutex::new(State {
                pending: PendingRequests::new(),
                listeners: ListenerMap::new(),
                reassembler: Reassembler::new(),
                tx_filter,
                rx_filter,
            }),
        }
    }

    /// Number of requests currently awaiting a response.
    pub fn pending(&self) -> usize {
        lock_ignore_poison(&self.state).pending.len()
    }

    /// Number of registered listeners.
    pub fn listeners(&self) -> usize {
        lock_ignore_poison(&self.state).listeners.len()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock_ignore_poison(&self.state)
    }

    /// Filter, fragment and publish one message.
    async fn send(&self, tx_raw: &TxRaw, msg: &MgmtMsg, mtu: usize) -> Result<()> {
        // ---
        let tx_filter = self.state().tx_filter.clone();

        let mut frame = msg.encode();
        if let Some(filter) = tx_filter {
            frame = filter(frame)?;
        }

        let chunks = fragment(&frame, mtu);
        log_debug!(
            "tx seq {} group {} id {}: {} bytes in {} chunk(s)",
            msg.hdr.seq,
            msg.hdr.group,
            msg.hdr.id,
            frame.len(),
            chunks.len()
        );

        for chunk in chunks {
            tx_raw(chunk).await?;
        }
        Ok(())
    }

    /// Route one decoded inbound frame.
    fn deliver(&self, msg: MgmtMsg) {
        // ---
        let mut state = self.state();

        if msg.hdr.is_response() && state.pending.contains(msg.seq()) {
            log_trace!("rx response seq {}", msg.seq());
            state.pending.complete(msg);
            return;
        }

        let mut delivered = 0usize;
        state.listeners.retain(|criteria, tx| {
            if !criteria.matches(&msg.hdr) {
                return true;
            }
            match tx.send(Ok(msg.clone())) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    log_warn!("listener {criteria:?} receiver dropped; unregistering");
                    false
                }
            }
        });

        if delivered == 0 {
            log_debug!(
                "dropping unsolicited frame op {} group {} id {} seq {}",
                msg.hdr.op,
                msg.hdr.group,
                msg.hdr.id,
                msg.hdr.seq
            );
        }
    }
}

impl Default for NmpTransceiver {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[async_trait::async_trait]
impl Transceiver for NmpTransceiver {
    // ---

    async fn tx_rx_mgmt(
        &self,
        tx_raw: TxRaw,
        msg: MgmtMsg,
        mtu: usize,
        timeout: Duration,
    ) -> Result<MgmtMsg> {
        // ---
        let seq = msg.seq();

        // Register before sending so a fast response cannot slip past.
        let rx = self.state().pending.register(seq)?;

        if let Err(err) = self.send(&tx_raw, &msg, mtu).await {
            self.state().pending.remove(seq);
            return Err(err);
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                let mut state = self.state();
                state.pending.remove(seq);
                if state.pending.is_empty() && state.reassembler.pending() > 0 {
                    // A lost trailing fragment must not shift later responses.
                    log_debug!("dropping {} partial byte(s)", state.reassembler.pending());
                    state.reassembler.reset();
                }
                log_debug!("seq {seq} timed out after {timeout:?}");
                Err(Error::Timeout)
            }
        }
    }

    async fn tx_observe(&self, tx_raw: TxRaw, msg: MgmtMsg, mtu: usize) -> Result<()> {
        self.send(&tx_raw, &msg, mtu).await
    }

    fn dispatch_rsp(&self, payload: Bytes) {
        // ---
        let (frames, rx_filter) = {
            let mut state = self.state();
            (state.reassembler.push(&payload), state.rx_filter.clone())
        };

        for frame in frames {
            let frame = match &rx_filter {
                Some(filter) => match filter(frame) {
                    Ok(frame) => frame,
                    Err(err) => {
                        log_warn!("rx filter rejected frame: {err}");
                        continue;
                    }
                },
                None => frame,
            };

            match MgmtMsg::decode(frame) {
                Ok(msg) => self.deliver(msg),
                Err(err) => log_warn!("dropping malformed frame: {err}"),
            }
        }
    }

    fn error_all(&self, err: Error) {
        // ---
        let mut state = self.state();

        let failed = state.pending.fail_all(&err);
        state.reassembler.reset();
        state
            .listeners
            .retain(|_, tx| tx.send(Err(err.clone())).is_ok());

        log_debug!("error_all({err}): failed {failed} pending request(s)");
    }

    fn listen(&self, criteria: MsgCriteria) -> Result<Listener> {
        // ---
        let mut state = self.state();
        if state.listeners.contains_key(&criteria) {
            return Err(Error::ListenerExists);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.listeners.insert(criteria, tx);
        Ok(Listener::new(criteria, rx))
    }

    fn stop_listen(&self, criteria: &MsgCriteria) {
        self.state().listeners.remove(criteria);
    }

    fn filters(&self) -> (Option<TxFilter>, Option<RxFilter>) {
        let state = self.state();
        (state.tx_filter.clone(), state.rx_filter.clone())
    }

    fn set_filters(&self, tx: Option<TxFilter>, rx: Option<RxFilter>) {
        let mut state = self.state();
        state.tx_filter = tx;
        state.rx_filter = rx;
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::mgmt::nmp::{NMP_OP_READ, NMP_OP_READ_RSP};
    use crate::BoxFuture;
    use std::sync::Arc;

    /// TxRaw that records every chunk it is asked to publish.
    fn recording_tx() -> (TxRaw, Arc<Mutex<Vec<Bytes>>>) {
        // ---
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let tx: TxRaw = Arc::new(move |chunk: Bytes| -> BoxFuture<'static, Result<()>> {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push(chunk);
                Ok(())
            })
        });
        (tx, sent)
    }

    fn req(seq: u8) -> MgmtMsg {
        MgmtMsg::new(NMP_OP_READ, 1, 0, seq, Bytes::from_static(b"req")).unwrap()
    }

    #[tokio::test]
    async fn test_response_completes_request() {
        // ---
        let txvr = Arc::new(NmpTransceiver::default());
        let (tx_raw, sent) = recording_tx();

        let call = {
            let txvr = txvr.clone();
            tokio::spawn(async move {
                txvr.tx_rx_mgmt(tx_raw, req(11), 235, Duration::from_secs(5))
                    .await
            })
        };

        while txvr.pending() == 0 {
            tokio::task::yield_now().await;
        }

        let rsp = MgmtMsg::response_to(&req(11), Bytes::from_static(b"rsp")).unwrap();
        txvr.dispatch_rsp(rsp.encode());

        let got = call.await.unwrap().unwrap();
        assert_eq!(got, rsp);
        assert_eq!(txvr.pending(), 0);
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_clears_pending() {
        // ---
        let txvr = NmpTransceiver::default();
        let (tx_raw, _sent) = recording_tx();

        let res = txvr
            .tx_rx_mgmt(tx_raw, req(3), 235, Duration::from_millis(20))
            .await;

        assert_eq!(res, Err(Error::Timeout));
        assert_eq!(txvr.pending(), 0);
    }

    #[tokio::test]
    async fn test_timeout_drops_partial_frame() {
        // ---
        let txvr = NmpTransceiver::default();
        let (tx_raw, _sent) = recording_tx();

        // First half of a response whose tail never arrives.
        let rsp = MgmtMsg::response_to(&req(5), vec![0u8; 30]).unwrap().encode();
        txvr.dispatch_rsp(rsp.slice(..12));

        let res = txvr
            .tx_rx_mgmt(tx_raw, req(5), 235, Duration::from_millis(20))
            .await;
        assert_eq!(res, Err(Error::Timeout));
        assert_eq!(txvr.state().reassembler.pending(), 0);
    }

    #[tokio::test]
    async fn test_fragments_to_mtu() {
        // ---
        let txvr = NmpTransceiver::default();
        let (tx_raw, sent) = recording_tx();

        let big = MgmtMsg::new(NMP_OP_READ, 1, 0, 1, vec![0u8; 100]).unwrap();
        txvr.tx_observe(tx_raw, big, 32).await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 4);
        assert!(sent.iter().all(|c| c.len() <= 32));
    }

    #[tokio::test]
    async fn test_send_failure_clears_pending() {
        // ---
        let txvr = NmpTransceiver::default();
        let failing: TxRaw = Arc::new(|_chunk: Bytes| -> BoxFuture<'static, Result<()>> {
            Box::pin(async { Err(Error::Publish("nope".into())) })
        });

        let res = txvr
            .tx_rx_mgmt(failing, req(8), 235, Duration::from_secs(1))
            .await;

        assert_eq!(res, Err(Error::Publish("nope".into())));
        assert_eq!(txvr.pending(), 0);
    }

    #[tokio::test]
    async fn test_tx_filter_rewrites_and_rejects() {
        // ---
        let txvr = NmpTransceiver::default();
        let (tx_raw, sent) = recording_tx();

        let prefix: TxFilter = Arc::new(|frame: Bytes| {
            let mut v = b"X".to_vec();
            v.extend_from_slice(&frame);
            Ok(Bytes::from(v))
        });
        txvr.set_filters(Some(prefix), None);
        txvr.tx_observe(tx_raw.clone(), req(1), 235).await.unwrap();
        assert_eq!(sent.lock().unwrap()[0][0], b'X');

        let reject: TxFilter = Arc::new(|_| Err(Error::Filter("blocked".into())));
        txvr.set_filters(Some(reject), None);
        assert_eq!(
            txvr.tx_observe(tx_raw, req(2), 235).await,
            Err(Error::Filter("blocked".into()))
        );
    }

    #[tokio::test]
    async fn test_listener_fanout_by_criteria() {
        // ---
        let txvr = NmpTransceiver::default();

        let mut all = txvr.listen(MsgCriteria::default()).unwrap();
        let mut grp9 = txvr.listen(MsgCriteria::group(9)).unwrap();
        assert_eq!(txvr.listen(MsgCriteria::group(9)).err(), Some(Error::ListenerExists));

        let notify = MgmtMsg::new(NMP_OP_READ_RSP, 9, 2, 200, vec![1]).unwrap();
        txvr.dispatch_rsp(notify.encode());

        let other = MgmtMsg::new(NMP_OP_READ_RSP, 4, 0, 201, vec![2]).unwrap();
        txvr.dispatch_rsp(other.encode());

        assert_eq!(all.try_recv(), Some(Ok(notify.clone())));
        assert_eq!(all.try_recv(), Some(Ok(other)));
        assert_eq!(grp9.try_recv(), Some(Ok(notify)));
        assert_eq!(grp9.try_recv(), None);

        txvr.stop_listen(&MsgCriteria::group(9));
        assert_eq!(txvr.listeners(), 1);
    }

    #[tokio::test]
    async fn test_error_all_reaches_pending_and_listeners() {
        // ---
        let txvr = Arc::new(NmpTransceiver::default());
        let (tx_raw, _sent) = recording_tx();
        let mut listener = txvr.listen(MsgCriteria::default()).unwrap();

        let call = {
            let txvr = txvr.clone();
            tokio::spawn(async move {
                txvr.tx_rx_mgmt(tx_raw, req(42), 235, Duration::from_secs(30))
                    .await
            })
        };

        while txvr.pending() == 0 {
            tokio::task::yield_now().await;
        }
        txvr.error_all(Error::Aborted);

        assert_eq!(call.await.unwrap(), Err(Error::Aborted));
        assert_eq!(listener.recv().await, Some(Err(Error::Aborted)));
    }
}
