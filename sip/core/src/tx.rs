//! Outgoing non-INVITE client requests.
//!
//! A sent request is matched to its responses by the Via branch. The
//! response wakes whichever task performed the send, which means a request
//! issued from inside a serializer is also completed inside it; transaction
//! continuity across serializers falls out of that for free.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::msg::top_via_branch;
use crate::transport::TpHandle;
use crate::{Error, Result};

/// Client transactions waiting for a final response.
#[derive(Default)]
pub struct PendingRequests {
    map: Mutex<HashMap<String, oneshot::Sender<rsip::Response>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, branch: String) -> oneshot::Receiver<rsip::Response> {
        let (tx, rx) = oneshot::channel();
        self.map.lock().insert(branch, tx);
        rx
    }

    fn remove(&self, branch: &str) {
        self.map.lock().remove(branch);
    }

    /// Route `response` to the matching sender.
    ///
    /// Provisional responses are swallowed (the transaction keeps waiting),
    /// final responses complete it. Returns false when no transaction
    /// matches, leaving the response to the caller.
    pub fn handle_response(&self, response: &rsip::Response) -> bool {
        let Some(branch) = top_via_branch(&response.headers) else {
            return false;
        };

        let code = response.status_code.code();

        if code < 200 {
            // Provisional: the transaction exists if we know the branch
            return self.map.lock().contains_key(&branch);
        }

        let Some(tx) = self.map.lock().remove(&branch) else {
            return false;
        };

        let _ = tx.send(response.clone());
        true
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }
}

struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    branch: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.branch);
    }
}

/// Sends requests and awaits their final response.
#[derive(Clone)]
pub struct Requester {
    pending: Arc<PendingRequests>,
    /// SIP timer B, the transaction timeout.
    timer_b: Duration,
    /// SIP timer T1, the retransmit base interval.
    timer_t1: Duration,
}

impl Requester {
    pub fn new(pending: Arc<PendingRequests>, timer_t1: Duration, timer_b: Duration) -> Self {
        Self {
            pending,
            timer_b,
            timer_t1,
        }
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    /// Send `request` over `transport` and wait for a final response.
    ///
    /// `branch` must be the branch of the request's topmost Via header. On
    /// unreliable transports the request is retransmitted with the usual
    /// doubling back-off until a response arrives or timer B fires.
    pub async fn send(
        &self,
        transport: &TpHandle,
        target: std::net::SocketAddr,
        branch: String,
        request: rsip::Request,
    ) -> Result<rsip::Response> {
        let bytes = request.to_string().into_bytes();

        let mut rx = self.pending.insert(branch.clone());

        // The guard also covers cancellation: a caller dropping this
        // future mid-flight must not leak the pending entry
        let _guard = PendingGuard {
            pending: &self.pending,
            branch: &branch,
        };

        self.send_inner(transport, target, &bytes, &mut rx).await
    }

    async fn send_inner(
        &self,
        transport: &TpHandle,
        target: std::net::SocketAddr,
        bytes: &[u8],
        rx: &mut oneshot::Receiver<rsip::Response>,
    ) -> Result<rsip::Response> {
        transport.send(bytes, target).await?;

        let deadline = tokio::time::Instant::now() + self.timer_b;
        let mut retransmit_in = self.timer_t1;

        loop {
            let next = if transport.reliable() {
                deadline
            } else {
                deadline.min(tokio::time::Instant::now() + retransmit_in)
            };

            tokio::select! {
                response = &mut *rx => {
                    return response.map_err(|_| Error::Timeout(target.to_string()));
                }
                _ = tokio::time::sleep_until(next) => {
                    if tokio::time::Instant::now() >= deadline {
                        log::debug!("request towards {target} timed out");
                        return Err(Error::Timeout(target.to_string()));
                    }

                    // Timer E retransmission, interval doubles up to T2
                    transport.send(bytes, target).await?;
                    retransmit_in = (retransmit_in * 2).min(Duration::from_secs(4));
                }
            }
        }
    }
}
