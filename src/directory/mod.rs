//! Connection registry and client directory.
//!
//! Every open socket is tracked in one map owned by the server instance.
//! Unregistered connections live under their transient connection id; a
//! successful `register` moves the entry to its composite id
//! `<clientId>:<tabId>` so several tabs of one logical client are addressed
//! independently.
//!
//! All mutations take the map lock for their whole duration, so registration,
//! eviction, and disconnect teardown are atomic relative to each other.

pub mod connection;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub use connection::{Connection, ConnectionInfo};

use crate::protocol::{ControlFrame, Register, RegistrationAck};
use crate::store::ClientStore;
use crate::{AppError, Result};

/// Build the directory key for one tab of a client.
#[must_use]
pub fn composite_client_id(client_id: &str, tab_id: &str) -> String {
    format!("{client_id}:{tab_id}")
}

/// Explicit registry object; share it by `Arc` with collaborators.
#[derive(Debug)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<String, Arc<Connection>>>,
    count_tx: watch::Sender<usize>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            entries: Mutex::new(HashMap::new()),
            count_tx,
        }
    }

    /// Track a newly opened socket under a fresh transient id.
    pub fn connect(
        &self,
        remote_address: impl Into<String>,
        outbound: mpsc::Sender<String>,
    ) -> Arc<Connection> {
        let connection_id = format!("conn-{}", uuid::Uuid::new_v4());
        let connection = Arc::new(Connection::new(
            connection_id.clone(),
            remote_address.into(),
            outbound,
        ));

        let count = {
            let mut entries = self.lock();
            entries.insert(connection_id.clone(), Arc::clone(&connection));
            entries.len()
        };
        self.count_tx.send_replace(count);

        info!(
            connection_id,
            remote = connection.remote_address(),
            connections = count,
            "connection opened"
        );
        connection
    }

    /// Handle a `register` frame and produce the acknowledgement to send.
    ///
    /// On success the entry moves from its current key to
    /// `<clientId>:<tabId>`. A different connection already holding that key
    /// is evicted: its pending calls fail and it is told it was superseded.
    /// On failure the connection is left untouched and stays open.
    pub fn register(
        &self,
        connection: &Arc<Connection>,
        frame: Register,
        store: &dyn ClientStore,
    ) -> RegistrationAck {
        let check = store.validate(&frame.client_id, frame.secret_key.as_deref());
        if !check.valid {
            let reason = check
                .reason
                .unwrap_or_else(|| "invalid credentials".to_owned());
            warn!(
                connection_id = connection.id(),
                client_id = %frame.client_id,
                %reason,
                "registration rejected"
            );
            return RegistrationAck::rejected(&frame.client_id, reason);
        }

        let tab_id = frame.capabilities.tab_id_or_default().to_owned();
        let composite_id = composite_client_id(&frame.client_id, &tab_id);
        let evaluations_count = store.list_evaluations(&frame.client_id).len();

        let evicted = {
            let mut entries = self.lock();

            let current_key = connection.directory_key();
            if entries
                .get(&current_key)
                .is_some_and(|existing| Arc::ptr_eq(existing, connection))
            {
                entries.remove(&current_key);
            }

            let evicted = entries
                .remove(&composite_id)
                .filter(|existing| !Arc::ptr_eq(existing, connection));
            if let Some(stale) = &evicted {
                stale.rpc().cancel_all("superseded by a newer connection");
                stale.clear_session();
                // Keep the stale socket reachable under its transient id.
                entries.insert(stale.id().to_owned(), Arc::clone(stale));
            }

            connection.apply_registration(
                &frame.client_id,
                &tab_id,
                &composite_id,
                frame.capabilities,
            );
            entries.insert(composite_id.clone(), Arc::clone(connection));
            evicted
        };

        if let Some(stale) = evicted {
            warn!(
                composite_id,
                stale_connection = stale.id(),
                "composite id re-registered, previous connection superseded"
            );
            stale.try_send_control(&ControlFrame::RegistrationAck(RegistrationAck::rejected(
                &frame.client_id,
                "superseded by a newer connection",
            )));
        }

        info!(
            connection_id = connection.id(),
            composite_id,
            evaluations = evaluations_count,
            "registration accepted"
        );
        RegistrationAck::accepted(&frame.client_id, evaluations_count)
    }

    /// Handle a `ready` frame.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the connection has not registered; the
    /// connection is not promoted.
    pub fn mark_ready(&self, connection: &Connection) -> Result<()> {
        if connection.apply_ready() {
            info!(composite_id = %connection.label(), "client ready");
            Ok(())
        } else {
            Err(AppError::Protocol(format!(
                "ready received before register on connection {}",
                connection.id()
            )))
        }
    }

    /// Tear down a closed socket.
    ///
    /// Fails all pending calls, removes the directory entry, and publishes
    /// the new connection count, atomically with respect to other
    /// registry mutations. Returns the number of calls cancelled. Calling it
    /// again for the same connection is a no-op.
    pub fn disconnect(&self, connection: &Arc<Connection>) -> usize {
        let (cancelled, removed, count) = {
            let mut entries = self.lock();
            let cancelled = connection.rpc().cancel_all("connection closed");

            let key = connection.directory_key();
            let removed = if entries
                .get(&key)
                .is_some_and(|existing| Arc::ptr_eq(existing, connection))
            {
                entries.remove(&key).is_some()
            } else {
                // A superseded connection lives under its transient id.
                entries
                    .get(connection.id())
                    .is_some_and(|existing| Arc::ptr_eq(existing, connection))
                    && entries.remove(connection.id()).is_some()
            };
            connection.clear_session();
            (cancelled, removed, entries.len())
        };

        if removed {
            self.count_tx.send_replace(count);
            info!(
                connection_id = connection.id(),
                cancelled_calls = cancelled,
                connections = count,
                "connection closed"
            );
        }
        cancelled
    }

    /// All registered connections, ordered by composite id.
    #[must_use]
    pub fn list_connected(&self) -> Vec<Arc<Connection>> {
        self.collect(|connection| connection.is_registered())
    }

    /// Registered connections that declared `ready`, ordered by composite id.
    #[must_use]
    pub fn ready_connections(&self) -> Vec<Arc<Connection>> {
        self.collect(|connection| connection.is_ready())
    }

    /// Every registered tab of one base client, ordered by composite id.
    #[must_use]
    pub fn get_tabs(&self, base_client_id: &str) -> Vec<Arc<Connection>> {
        self.collect(|connection| {
            connection.is_registered()
                && connection.client_id().as_deref() == Some(base_client_id)
        })
    }

    /// Look up a registered connection by composite id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` ("… is not connected") when no
    /// registered connection holds `composite_id`.
    pub fn get_client(&self, composite_id: &str) -> Result<Arc<Connection>> {
        self.lock()
            .get(composite_id)
            .filter(|connection| connection.is_registered())
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("client '{composite_id}' is not connected")))
    }

    /// Number of open sockets, registered or not.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// Subscribe to connection-count changes.
    #[must_use]
    pub fn subscribe_count(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }

    fn collect(&self, keep: impl Fn(&Connection) -> bool) -> Vec<Arc<Connection>> {
        let mut found: Vec<(String, Arc<Connection>)> = self
            .lock()
            .iter()
            .filter(|(_, connection)| keep(connection))
            .map(|(key, connection)| (key.clone(), Arc::clone(connection)))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found.into_iter().map(|(_, connection)| connection).collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Connection>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
