use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::{Error, MgmtMsg, Result};

/// Requests awaiting a response, keyed by NMP sequence number.
///
/// When a response arrives its sequence selects the waiting caller's oneshot
/// channel. A sequence can be in flight only once per session.
pub(super) struct PendingRequests {
    // ---
    requests: HashMap<u8, oneshot::Sender<Result<MgmtMsg>>>,
}

impl PendingRequests {
    // ---

    pub fn new() -> Self {
        // ---
        Self {
            requests: HashMap::new(),
        }
    }

    /// Register a wait for `seq`.
    ///
    /// Fails if a request with the same sequence is still outstanding.
    pub fn register(&mut self, seq: u8) -> Result<oneshot::Receiver<Result<MgmtMsg>>> {
        // ---
        if self.requests.contains_key(&seq) {
            return Err(Error::Frame(format!("sequence {seq} already in flight")));
        }
        let (tx, rx) = oneshot::channel();
        self.requests.insert(seq, tx);
        Ok(rx)
    }

    pub fn contains(&self, seq: u8) -> bool {
        self.requests.contains_key(&seq)
    }

    /// Deliver a response to the caller waiting on its sequence.
    ///
    /// Returns false if nobody is waiting (late response after a timeout).
    pub fn complete(&mut self, rsp: MgmtMsg) -> bool {
        // ---
        match self.requests.remove(&rsp.seq()) {
            Some(tx) => {
                // Receiver may already be gone if its timeout just fired.
                let _ = tx.send(Ok(rsp));
                true
            }
            None => false,
        }
    }

    /// Drop a wait without delivering anything (timeout or send failure).
    pub fn remove(&mut self, seq: u8) -> bool {
        // ---
        self.requests.remove(&seq).is_some()
    }

    /// Fail every outstanding wait with `err`; returns how many were failed.
    pub fn fail_all(&mut self, err: &Error) -> usize {
        // ---
        let n = self.requests.len();
        for (_, tx) in self.requests.drain() {
            let _ = tx.send(Err(err.clone()));
        }
        n
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
