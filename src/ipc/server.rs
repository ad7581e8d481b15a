//! Local IPC server for `evalbridge-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands
//! and routes them to the dispatcher and registry.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "connected"}
//! {"command": "run", "client": "c1:t1", "evaluation": "e1"}
//! {"command": "run_tab", "client": "c1", "tab": "t1", "evaluation": "e1"}
//! {"command": "eval", "evaluation": "all"}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found: client 'c9' is not connected"}
//! ```

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::dispatch::{BatchSelector, Dispatcher};
use crate::{AppError, Result};

/// Inbound IPC request from `evalbridge-ctl`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpcRequest {
    /// Command verb.
    pub command: String,
    /// Base or composite client id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    /// Tab id (for `run_tab`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<String>,
    /// Evaluation id, or `all` for `eval`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<String>,
    /// Shared-secret authentication token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl IpcRequest {
    /// Request with only the command verb set.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }
}

/// Outbound IPC response to `evalbridge-ctl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    fn from_result<T: Serialize>(result: Result<T>) -> Self {
        match result.and_then(|data| Ok(serde_json::to_value(data)?)) {
            Ok(data) => Self::success(data),
            Err(err) => Self::error(err.to_string()),
        }
    }
}

/// State the IPC handlers operate on.
pub struct IpcState {
    /// Server identity reported by `status`.
    pub server_id: String,
    /// Dispatcher, which also exposes the registry and store.
    pub dispatcher: Arc<Dispatcher>,
    /// Shared secret required on every request when set.
    pub auth_token: Option<String>,
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    name: &str,
    state: Arc<IpcState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = name.to_owned();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tokio::spawn(handle_connection(stream, Arc::clone(&state)));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(stream: interprocess::local_socket::tokio::Stream, state: Arc<IpcState>) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => handle_request(&request, &state).await,
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Authenticate and route one operator command.
pub async fn handle_request(request: &IpcRequest, state: &IpcState) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    async move {
        if let Some(ref expected) = state.auth_token {
            match request.auth_token {
                Some(ref provided) if provided == expected => {}
                _ => {
                    warn!("IPC request rejected: invalid auth token");
                    return IpcResponse::error("unauthorized");
                }
            }
        }

        let dispatcher = &state.dispatcher;
        match request.command.as_str() {
            "status" => IpcResponse::success(json!({
                "server_id": state.server_id,
                "summary": dispatcher.summary(),
                "evaluations": dispatcher.tracker().list(request.client.as_deref()),
            })),
            "clients" => handle_clients(dispatcher),
            "connected" => IpcResponse::success(json!({
                "connections": dispatcher
                    .registry()
                    .list_connected()
                    .iter()
                    .map(|connection| connection.info())
                    .collect::<Vec<_>>(),
            })),
            "tabs" => match required(&request.client, "client") {
                Ok(client) => IpcResponse::success(json!({
                    "client_id": client,
                    "tabs": dispatcher
                        .registry()
                        .get_tabs(client)
                        .iter()
                        .map(|connection| connection.info())
                        .collect::<Vec<_>>(),
                })),
                Err(response) => response,
            },
            "run" => match (required(&request.client, "client"), required(&request.evaluation, "evaluation")) {
                (Ok(client), Ok(evaluation)) => {
                    IpcResponse::from_result(dispatcher.run(client, evaluation).await)
                }
                (Err(response), _) | (_, Err(response)) => response,
            },
            "run_all" => match required(&request.client, "client") {
                Ok(client) => IpcResponse::from_result(dispatcher.run_all(client).await),
                Err(response) => response,
            },
            "run_tab" => match (
                required(&request.client, "client"),
                required(&request.tab, "tab"),
                required(&request.evaluation, "evaluation"),
            ) {
                (Ok(client), Ok(tab), Ok(evaluation)) => {
                    IpcResponse::from_result(dispatcher.run_tab(client, tab, evaluation).await)
                }
                (Err(response), _, _) | (_, Err(response), _) | (_, _, Err(response)) => response,
            },
            "eval" => {
                let selector = BatchSelector::parse(request.evaluation.as_deref().unwrap_or("all"));
                IpcResponse::from_result(dispatcher.evaluate_all_clients(&selector).await)
            }
            "reset" => match (required(&request.client, "client"), required(&request.evaluation, "evaluation")) {
                (Ok(client), Ok(evaluation)) => {
                    IpcResponse::from_result(dispatcher.reset(client, evaluation))
                }
                (Err(response), _) | (_, Err(response)) => response,
            },
            other => IpcResponse::error(format!("unknown command: {other}")),
        }
    }
    .instrument(span)
    .await
}

fn handle_clients(dispatcher: &Dispatcher) -> IpcResponse {
    let clients: Vec<Value> = dispatcher
        .store()
        .list_clients()
        .iter()
        .map(|client| {
            json!({
                "client_id": client.client_id,
                "name": client.name,
                "description": client.description,
                "evaluations": client.evaluations.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
                "connected_tabs": dispatcher.registry().get_tabs(&client.client_id).len(),
            })
        })
        .collect();
    IpcResponse::success(json!({ "clients": clients }))
}

fn required<'a>(field: &'a Option<String>, name: &str) -> std::result::Result<&'a str, IpcResponse> {
    field
        .as_deref()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| IpcResponse::error(format!("missing required '{name}' field")))
}
