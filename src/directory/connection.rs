//! One live agent socket and its session state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::protocol::{encode_frame, Capabilities, ControlFrame};
use crate::rpc::{PendingCallInfo, RpcCorrelator};
use crate::{AppError, Result};

/// Mutable session state guarded by the connection's mutex.
#[derive(Debug)]
struct SessionState {
    registered: bool,
    ready: bool,
    client_id: Option<String>,
    composite_id: Option<String>,
    tab_id: Option<String>,
    capabilities: Capabilities,
    last_seen: DateTime<Utc>,
    /// Sized to the declared `maxConcurrency` at registration.
    dispatch_slots: Arc<Semaphore>,
    slot_count: usize,
}

/// Serializable snapshot of a connection for operator listings.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConnectionInfo {
    /// Transient connection id.
    pub connection_id: String,
    /// Base client id once registered.
    pub client_id: Option<String>,
    /// `client:tab` once registered.
    pub composite_id: Option<String>,
    /// Tab id once registered.
    pub tab_id: Option<String>,
    /// Whether `register` was accepted.
    pub registered: bool,
    /// Whether `ready` was received after registration.
    pub ready: bool,
    /// Declared capabilities.
    pub capabilities: Capabilities,
    /// Peer address.
    pub remote_address: String,
    /// Socket open time.
    pub connected_at: DateTime<Utc>,
    /// Last inbound frame time.
    pub last_seen: DateTime<Utc>,
    /// Outstanding RPC calls.
    pub pending_calls: usize,
    /// The outstanding calls themselves.
    pub in_flight: Vec<PendingCallInfo>,
}

/// A single agent WebSocket connection.
///
/// Created by [`ConnectionRegistry::connect`](super::ConnectionRegistry::connect);
/// the registry owns all transitions of `registered`/`ready`.
#[derive(Debug)]
pub struct Connection {
    connection_id: String,
    remote_address: String,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<String>,
    rpc: RpcCorrelator,
    state: Mutex<SessionState>,
}

impl Connection {
    pub(crate) fn new(
        connection_id: String,
        remote_address: String,
        outbound: mpsc::Sender<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            rpc: RpcCorrelator::new(connection_id.clone(), outbound.clone()),
            connection_id,
            remote_address,
            connected_at: now,
            outbound,
            state: Mutex::new(SessionState {
                registered: false,
                ready: false,
                client_id: None,
                composite_id: None,
                tab_id: None,
                capabilities: Capabilities::default(),
                last_seen: now,
                dispatch_slots: Arc::new(Semaphore::new(1)),
                slot_count: 1,
            }),
        }
    }

    /// Transient connection id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.connection_id
    }

    /// Peer address as reported by the listener.
    #[must_use]
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Socket open time.
    #[must_use]
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// The connection's request/response correlator.
    #[must_use]
    pub fn rpc(&self) -> &RpcCorrelator {
        &self.rpc
    }

    /// Whether `register` was accepted on this connection.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.lock().registered
    }

    /// Whether the connection may receive `evaluate` calls.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let state = self.lock();
        state.registered && state.ready
    }

    /// Base client id once registered.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.lock().client_id.clone()
    }

    /// Composite `client:tab` id once registered.
    #[must_use]
    pub fn composite_id(&self) -> Option<String> {
        self.lock().composite_id.clone()
    }

    /// Tab id once registered.
    #[must_use]
    pub fn tab_id(&self) -> Option<String> {
        self.lock().tab_id.clone()
    }

    /// Declared capabilities.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.lock().capabilities.clone()
    }

    /// Directory key: the composite id when registered, else the connection id.
    #[must_use]
    pub fn directory_key(&self) -> String {
        self.lock()
            .composite_id
            .clone()
            .unwrap_or_else(|| self.connection_id.clone())
    }

    /// Human-readable label for log fields and error messages.
    #[must_use]
    pub fn label(&self) -> String {
        self.directory_key()
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        self.lock().last_seen = Utc::now();
    }

    /// Wait for a free dispatch slot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConnectionClosed` if the slots were closed because
    /// the connection went away.
    pub async fn acquire_dispatch_slot(&self) -> Result<OwnedSemaphorePermit> {
        let slots = Arc::clone(&self.lock().dispatch_slots);
        slots.acquire_owned().await.map_err(|_| {
            AppError::ConnectionClosed(format!("connection {} is closed", self.label()))
        })
    }

    /// Queue a raw frame for the writer task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConnectionClosed` if the writer task has stopped.
    pub async fn send_text(&self, text: String) -> Result<()> {
        self.outbound.send(text).await.map_err(|_| {
            AppError::ConnectionClosed(format!("connection {} is closed", self.label()))
        })
    }

    /// Serialize and queue a control frame.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` on serialization failure or
    /// `AppError::ConnectionClosed` if the writer task has stopped.
    pub async fn send_control(&self, frame: &ControlFrame) -> Result<()> {
        self.send_text(encode_frame(frame)?).await
    }

    /// Queue a control frame without waiting; dropped if the queue is full.
    pub(crate) fn try_send_control(&self, frame: &ControlFrame) {
        match encode_frame(frame) {
            Ok(text) => {
                if self.outbound.try_send(text).is_err() {
                    debug!(connection_id = %self.connection_id, "outbound queue unavailable, frame dropped");
                }
            }
            Err(err) => debug!(connection_id = %self.connection_id, %err, "frame not encodable"),
        }
    }

    /// Snapshot for operator listings.
    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        let state = self.lock();
        ConnectionInfo {
            connection_id: self.connection_id.clone(),
            client_id: state.client_id.clone(),
            composite_id: state.composite_id.clone(),
            tab_id: state.tab_id.clone(),
            registered: state.registered,
            ready: state.ready,
            capabilities: state.capabilities.clone(),
            remote_address: self.remote_address.clone(),
            connected_at: self.connected_at,
            last_seen: state.last_seen,
            pending_calls: self.rpc.pending_count(),
            in_flight: self.rpc.pending_calls(),
        }
    }

    // ── Registry-owned transitions ───────────────────────────────────────────

    pub(crate) fn apply_registration(
        &self,
        client_id: &str,
        tab_id: &str,
        composite_id: &str,
        capabilities: Capabilities,
    ) {
        let mut state = self.lock();
        let slots = capabilities.effective_max_concurrency();
        state.registered = true;
        state.ready = false;
        state.client_id = Some(client_id.to_owned());
        state.tab_id = Some(tab_id.to_owned());
        state.composite_id = Some(composite_id.to_owned());
        state.capabilities = capabilities;
        state.resize_dispatch_slots(slots);
    }

    /// Returns `false` when the connection is not registered.
    pub(crate) fn apply_ready(&self) -> bool {
        let mut state = self.lock();
        if !state.registered {
            return false;
        }
        state.ready = true;
        true
    }

    pub(crate) fn clear_session(&self) {
        let mut state = self.lock();
        state.registered = false;
        state.ready = false;
        state.composite_id = None;
        state.dispatch_slots.close();
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionState {
    /// Apply a new `maxConcurrency`.
    ///
    /// Permits held by in-flight calls belong to the current semaphore, so
    /// it is only replaced when it is closed or idle. While calls are out it
    /// can grow but not shrink; the smaller size applies once it is idle at
    /// the next registration.
    fn resize_dispatch_slots(&mut self, slots: usize) {
        let slots = slots.min(Semaphore::MAX_PERMITS);
        let idle = self.dispatch_slots.available_permits() == self.slot_count;
        if self.dispatch_slots.is_closed() || idle {
            self.dispatch_slots = Arc::new(Semaphore::new(slots));
            self.slot_count = slots;
        } else if slots > self.slot_count {
            self.dispatch_slots.add_permits(slots - self.slot_count);
            self.slot_count = slots;
        }
    }
}
