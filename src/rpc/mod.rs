//! Per-connection JSON-RPC request/response correlation.
//!
//! Each connection owns one [`RpcCorrelator`]. Outbound calls are tracked in
//! an explicit map from correlation id to a [`PendingCall`] record holding the
//! deadline and the `oneshot` completion signal. Inbound responses resolve the
//! matching entry; entries are removed on response, on timeout, when the
//! awaiting caller is dropped, or by [`RpcCorrelator::cancel_all`].

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::{encode_frame, now_millis, RpcRequest, RpcResponse};
use crate::{AppError, Result};

/// Bookkeeping for one outstanding call.
#[derive(Debug)]
struct PendingCall {
    method: String,
    deadline: Instant,
    tx: oneshot::Sender<Result<Value>>,
}

/// Snapshot of an outstanding call, shown by the operator `connected`
/// listing.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PendingCallInfo {
    /// Correlation id.
    pub id: String,
    /// Method name.
    pub method: String,
    /// Milliseconds left before the call times out.
    pub remaining_ms: u64,
}

/// Request/response matcher bound to one connection's outbound channel.
#[derive(Debug)]
pub struct RpcCorrelator {
    /// Connection label used in log fields.
    label: String,
    /// Frames written here are delivered to the peer by the writer task.
    outbound: mpsc::Sender<String>,
    pending: Mutex<HashMap<String, PendingCall>>,
}

/// Removes its pending entry when the awaiting future finishes or is dropped.
struct PendingGuard<'a> {
    correlator: &'a RpcCorrelator,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.remove(&self.id);
    }
}

impl RpcCorrelator {
    /// Create a correlator writing request frames to `outbound`.
    #[must_use]
    pub fn new(label: impl Into<String>, outbound: mpsc::Sender<String>) -> Self {
        Self {
            label: label.into(),
            outbound,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Issue `method` to the peer and wait for its response.
    ///
    /// The call fails with [`AppError::Timeout`] when no response arrives
    /// within `timeout`; its entry is removed at that point so a late
    /// response is dropped as unmatched.
    ///
    /// # Errors
    ///
    /// - [`AppError::Timeout`]: no response within `timeout`.
    /// - [`AppError::Rpc`]: the peer answered with a JSON-RPC error.
    /// - [`AppError::ConnectionClosed`]: the outbound channel is closed or
    ///   [`cancel_all`](Self::cancel_all) ran while the call was pending.
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();

        let id = {
            let mut pending = self.lock();
            let mut id = generate_call_id();
            while pending.contains_key(&id) {
                id = generate_call_id();
            }
            pending.insert(
                id.clone(),
                PendingCall {
                    method: method.to_owned(),
                    deadline,
                    tx,
                },
            );
            id
        };
        let _guard = PendingGuard {
            correlator: self,
            id: id.clone(),
        };

        let frame = encode_frame(&RpcRequest::new(id.clone(), method, params))?;
        if self.outbound.send(frame).await.is_err() {
            return Err(AppError::ConnectionClosed(format!(
                "cannot send {method} call {id}: connection {} is closed",
                self.label
            )));
        }
        debug!(connection = %self.label, rpc_id = %id, method, "rpc: call issued");

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AppError::ConnectionClosed(format!(
                "{method} call {id} abandoned"
            ))),
            Err(_) => {
                warn!(connection = %self.label, rpc_id = %id, method, "rpc: call timed out");
                Err(AppError::Timeout(format!(
                    "{method} call {id} timed out after {} ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Offer an inbound response to the pending map.
    ///
    /// Returns `true` when the response matched an outstanding call and was
    /// consumed; `false` when the id is unknown (never issued, already timed
    /// out, or already answered).
    pub fn handle_response(&self, response: RpcResponse) -> bool {
        let Some(call) = self.lock().remove(&response.id) else {
            return false;
        };

        debug!(
            connection = %self.label,
            rpc_id = %response.id,
            method = %call.method,
            "rpc: response matched"
        );

        // The receiver may already be gone if the caller was dropped.
        let _ = call.tx.send(response.into_result());
        true
    }

    /// Fail every outstanding call with [`AppError::ConnectionClosed`].
    ///
    /// Idempotent; returns the number of calls that were failed.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, PendingCall)> = self.lock().drain().collect();
        let count = drained.len();

        for (id, call) in drained {
            let _ = call.tx.send(Err(AppError::ConnectionClosed(format!(
                "{} call {id} cancelled: {reason}",
                call.method
            ))));
        }

        if count > 0 {
            debug!(connection = %self.label, count, reason, "rpc: pending calls cancelled");
        }
        count
    }

    /// Number of calls currently outstanding.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Whether `id` is currently outstanding.
    #[must_use]
    pub fn is_pending(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Snapshot of outstanding calls, soonest deadline first.
    #[must_use]
    pub fn pending_calls(&self) -> Vec<PendingCallInfo> {
        let now = Instant::now();
        let mut calls: Vec<PendingCallInfo> = self
            .lock()
            .iter()
            .map(|(id, call)| PendingCallInfo {
                id: id.clone(),
                method: call.method.clone(),
                remaining_ms: u64::try_from(call.deadline.saturating_duration_since(now).as_millis())
                    .unwrap_or(u64::MAX),
            })
            .collect();
        calls.sort_by_key(|call| call.remaining_ms);
        calls
    }

    fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Correlation id of the form `rpc-<epoch ms>-<random hex>`.
fn generate_call_id() -> String {
    format!("rpc-{}-{:08x}", now_millis(), rand::random::<u32>())
}
