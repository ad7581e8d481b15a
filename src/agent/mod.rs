//! Agent runtime: the automation-client side of the protocol.
//!
//! The runtime answers the server's session handshake, keeps a heartbeat
//! running while registered, and executes inbound `evaluate` requests against
//! its [`ToolRegistry`], each raced against the request's time budget.
//! Redialing after a closed socket is left to the enclosing process.
//!
//! [`AgentRuntime::handle_text`] is transport-agnostic; [`AgentRuntime::run_connection`]
//! drives it over a `tokio-tungstenite` socket.

pub mod tools;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::protocol::rpc::{
    INVALID_PARAMS, METHOD_EVALUATE, METHOD_NOT_FOUND, TOOL_EXECUTION_ERROR, TOOL_TIMEOUT,
};
use crate::protocol::{
    encode_frame, now_millis, parse_inbound_frame, AckStatus, Capabilities, ControlFrame,
    EvaluateParams, EvaluateResult, Heartbeat, InboundFrame, Register, RpcRequest, RpcResponse,
};
use crate::{AppError, Result};

pub use tools::{Tool, ToolCall, ToolOutput, ToolRegistry};

/// Default interval between `ping` frames.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

const OUTBOUND_QUEUE: usize = 64;

/// Identity and capabilities the runtime registers with.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base client id.
    pub client_id: String,
    /// Shared secret, if the client has one.
    pub secret_key: Option<String>,
    /// Tab id; the server applies its default when `None`.
    pub tab_id: Option<String>,
    /// Declared parallelism.
    pub max_concurrency: Option<u32>,
    /// Interval between `ping` frames.
    pub heartbeat_interval: Duration,
}

impl AgentConfig {
    /// Config with defaults for everything but the client id.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            secret_key: None,
            tab_id: None,
            max_concurrency: None,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

#[derive(Debug, Default)]
struct AgentSession {
    registered: bool,
    ready: bool,
    server_id: Option<String>,
    heartbeat: Option<CancellationToken>,
}

/// Client-side protocol state machine.
pub struct AgentRuntime {
    config: AgentConfig,
    tools: Arc<ToolRegistry>,
    session: Mutex<AgentSession>,
    in_flight: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl AgentRuntime {
    /// Create a runtime serving `tools`.
    #[must_use]
    pub fn new(config: AgentConfig, tools: ToolRegistry) -> Self {
        Self {
            config,
            tools: Arc::new(tools),
            session: Mutex::new(AgentSession::default()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether the server accepted this runtime's registration.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.session().registered
    }

    /// Whether `ready` has been sent for the current registration.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.session().ready
    }

    /// Server id from the last `welcome`.
    #[must_use]
    pub fn server_id(&self) -> Option<String> {
        self.session().server_id.clone()
    }

    /// Number of `evaluate` requests currently executing.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// The `register` frame this runtime sends after `welcome`.
    #[must_use]
    pub fn register_frame(&self) -> ControlFrame {
        ControlFrame::Register(Register {
            client_id: self.config.client_id.clone(),
            secret_key: self.config.secret_key.clone(),
            capabilities: Capabilities {
                tools: self.tools.names(),
                max_concurrency: self.config.max_concurrency,
                version: Some(env!("CARGO_PKG_VERSION").to_owned()),
                tab_id: self.config.tab_id.clone(),
            },
        })
    }

    /// Process one inbound text frame, queueing any replies on `outbound`.
    ///
    /// Malformed or unexpected frames are logged and dropped.
    pub async fn handle_text(&self, text: &str, outbound: &mpsc::Sender<String>) {
        let frame = match parse_inbound_frame(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "inbound frame dropped");
                return;
            }
        };

        match frame {
            InboundFrame::Request(request) => self.handle_request(request, outbound).await,
            InboundFrame::Response(response) => {
                debug!(rpc_id = %response.id, "response with no outstanding call dropped");
            }
            InboundFrame::Control(control) => self.handle_control(control, outbound).await,
        }
    }

    /// Clear session state after the socket closed.
    ///
    /// Stops the heartbeat and aborts every executing request.
    pub fn on_disconnect(&self) {
        {
            let mut session = self.session();
            session.registered = false;
            session.ready = false;
            if let Some(heartbeat) = session.heartbeat.take() {
                heartbeat.cancel();
            }
        }
        let aborted: Vec<AbortHandle> = lock(&self.in_flight).drain().map(|(_, h)| h).collect();
        for handle in &aborted {
            handle.abort();
        }
        if !aborted.is_empty() {
            info!(aborted = aborted.len(), "in-flight evaluations abandoned");
        }
    }

    /// Dial `url` and serve frames until the socket closes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConnectionClosed` if the connection cannot be
    /// established. A socket that later closes is a normal return.
    pub async fn run_connection(&self, url: &str) -> Result<()> {
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|err| AppError::ConnectionClosed(format!("failed to connect to {url}: {err}")))?;
        info!(url, "connected to evaluation server");

        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(text.into())).await {
                    debug!(%err, "websocket write failed, writer stopping");
                    break;
                }
            }
        });

        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => self.handle_text(text.as_str(), &outbound_tx).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "websocket read failed");
                    break;
                }
            }
        }

        self.on_disconnect();
        writer.abort();
        info!("disconnected from evaluation server");
        Ok(())
    }

    // ── Frame handlers ───────────────────────────────────────────────────────

    async fn handle_control(&self, frame: ControlFrame, outbound: &mpsc::Sender<String>) {
        match frame {
            ControlFrame::Welcome(welcome) => {
                info!(server_id = %welcome.server_id, version = %welcome.version, "welcome received");
                self.session().server_id = Some(welcome.server_id);
                send(outbound, &self.register_frame()).await;
            }
            ControlFrame::RegistrationAck(ack) if ack.status == AckStatus::Accepted => {
                info!(
                    client_id = %ack.client_id,
                    evaluations = ack.evaluations_count,
                    "registration accepted"
                );
                self.session().registered = true;
                send(outbound, &ControlFrame::Ready).await;
                self.session().ready = true;
                self.start_heartbeat(outbound.clone());
            }
            ControlFrame::RegistrationAck(ack) => {
                warn!(client_id = %ack.client_id, reason = ?ack.reason, "registration rejected");
                let mut session = self.session();
                session.registered = false;
                session.ready = false;
                if let Some(heartbeat) = session.heartbeat.take() {
                    heartbeat.cancel();
                }
            }
            ControlFrame::Ping(Heartbeat { timestamp }) => {
                send(outbound, &ControlFrame::Pong(Heartbeat { timestamp })).await;
            }
            ControlFrame::Pong(_) => debug!("pong received"),
            ControlFrame::Register(_)
            | ControlFrame::Ready
            | ControlFrame::Status(_)
            | ControlFrame::Unrecognized => warn!("unexpected control frame dropped"),
        }
    }

    async fn handle_request(&self, request: RpcRequest, outbound: &mpsc::Sender<String>) {
        if request.method != METHOD_EVALUATE {
            let reply = RpcResponse::failure(
                request.id,
                METHOD_NOT_FOUND,
                format!("method '{}' not found", request.method),
            );
            send(outbound, &reply).await;
            return;
        }

        let duplicate = lock(&self.in_flight).contains_key(&request.id);
        if duplicate {
            let reply = RpcResponse::failure(
                request.id,
                INVALID_PARAMS,
                "a request with this id is already executing",
            );
            send(outbound, &reply).await;
            return;
        }

        let id = request.id.clone();
        let tools = Arc::clone(&self.tools);
        let registry = Arc::clone(&self.in_flight);
        let outbound = outbound.clone();
        let span = info_span!("evaluate", rpc_id = %id);
        let mut in_flight = lock(&self.in_flight);
        let task = tokio::spawn(
            async move {
                let reply = execute_evaluate(&tools, request).await;
                lock(&registry).remove(&reply.id);
                send(&outbound, &reply).await;
            }
            .instrument(span),
        );
        in_flight.insert(id, task.abort_handle());
    }

    fn start_heartbeat(&self, outbound: mpsc::Sender<String>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.session().heartbeat.replace(token.clone()) {
            previous.cancel();
        }

        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let ping = ControlFrame::Ping(Heartbeat { timestamp: now_millis() });
                        let Ok(text) = encode_frame(&ping) else { break };
                        if outbound.send(text).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("heartbeat stopped");
        });
    }

    fn session(&self) -> MutexGuard<'_, AgentSession> {
        lock(&self.session)
    }
}

/// Resolve the tool, run it against the request's time budget, and build
/// the reply carrying the original id.
async fn execute_evaluate(tools: &ToolRegistry, request: RpcRequest) -> RpcResponse {
    let id = request.id;
    let params: EvaluateParams = match serde_json::from_value(request.params) {
        Ok(params) => params,
        Err(err) => {
            return RpcResponse::failure(id, INVALID_PARAMS, format!("invalid evaluate params: {err}"))
        }
    };
    let Some(tool) = tools.get(&params.tool) else {
        return RpcResponse::failure(
            id,
            METHOD_NOT_FOUND,
            format!("tool '{}' is not available", params.tool),
        );
    };

    let started = Instant::now();
    let budget = Duration::from_millis(params.timeout);
    let outcome = tokio::time::timeout(budget, tool.execute(ToolCall::from(&params))).await;
    let execution_time = started.elapsed().as_secs_f64() * 1000.0;

    match outcome {
        Err(_) => {
            warn!(tool = %params.tool, timeout_ms = params.timeout, "tool timed out");
            RpcResponse::failure(
                id,
                TOOL_TIMEOUT,
                format!("tool '{}' timed out after {} ms", params.tool, params.timeout),
            )
        }
        Ok(Err(err)) => {
            warn!(tool = %params.tool, %err, "tool failed");
            RpcResponse::failure(id, TOOL_EXECUTION_ERROR, err.to_string())
        }
        Ok(Ok(output)) => {
            let result = EvaluateResult {
                output: output.output,
                execution_time,
                status: Some("completed".into()),
                steps: output.steps,
                metadata: params.metadata,
            };
            match serde_json::to_value(result) {
                Ok(value) => RpcResponse::success(id, value),
                Err(err) => RpcResponse::failure(id, TOOL_EXECUTION_ERROR, err.to_string()),
            }
        }
    }
}

async fn send<T: serde::Serialize>(outbound: &mpsc::Sender<String>, frame: &T) {
    match encode_frame(frame) {
        Ok(text) => {
            if outbound.send(text).await.is_err() {
                debug!("outbound channel closed, frame dropped");
            }
        }
        Err(err) => warn!(%err, "frame not encodable"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
