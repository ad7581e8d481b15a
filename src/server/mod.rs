//! WebSocket server process.
//!
//! An axum router serves the agent WebSocket endpoint at `/` and `/ws` plus a
//! `/health` check. [`EvalServer::bind`] starts listening and returns a handle
//! whose [`stop`](EvalServer::stop) closes the listener; sockets that are
//! already open are left to close on their own.

mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::directory::ConnectionRegistry;
use crate::dispatch::Dispatcher;
use crate::store::ClientStore;
use crate::{AppError, Result};

/// Shared state handed to every connection handler.
pub struct ServerState {
    /// Value of `serverId` in the `welcome` frame.
    pub server_id: String,
    /// Connection registry shared with the dispatcher and operator IPC.
    pub registry: Arc<ConnectionRegistry>,
    /// Credential and evaluation lookups.
    pub store: Arc<dyn ClientStore>,
    /// Receives proactive `status` frames.
    pub dispatcher: Arc<Dispatcher>,
}

impl ServerState {
    /// Assemble state around an existing dispatcher, reusing its registry and
    /// store.
    #[must_use]
    pub fn new(server_id: impl Into<String>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            server_id: server_id.into(),
            registry: Arc::clone(dispatcher.registry()),
            store: Arc::clone(dispatcher.store()),
            dispatcher,
        }
    }
}

/// Handler for `GET /health`.
async fn health() -> &'static str {
    "ok"
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    ws.on_upgrade(move |socket| session::run_session(socket, remote, state))
}

/// Build the HTTP router.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", get(upgrade))
        .route("/ws", get(upgrade))
        .route("/health", get(health))
        .with_state(state)
}

/// Handle to a running listener.
pub struct EvalServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl EvalServer {
    /// Bind `addr` and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, state: Arc<ServerState>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| AppError::Config(format!("failed to bind {addr}: {err}")))?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let ct = shutdown.clone();
        let app = router(state).into_make_service_with_connect_info::<SocketAddr>();

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { ct.cancelled().await })
                .await
                .map_err(|err| AppError::Io(format!("server error: {err}")))?;
            info!("listener closed");
            Ok(())
        });

        info!(%local_addr, "evaluation server listening");
        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listening socket.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the listener task to finish.
    ///
    /// # Errors
    ///
    /// Returns the listener's error, or `AppError::Io` if the task panicked.
    pub async fn wait(self) -> Result<()> {
        self.task
            .await
            .map_err(|err| AppError::Io(format!("server task failed: {err}")))?
    }
}
