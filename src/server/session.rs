//! Per-socket read loop and frame routing.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info_span, warn, Instrument};

use super::ServerState;
use crate::directory::Connection;
use crate::protocol::rpc::METHOD_NOT_FOUND;
use crate::protocol::{
    classify_inbound_frame, now_millis, ControlFrame, Heartbeat, InboundFrame, RpcResponse,
    Welcome,
};

/// Frames queued for one socket before senders start waiting.
const OUTBOUND_QUEUE: usize = 64;

pub(super) async fn run_session(socket: WebSocket, remote: SocketAddr, state: Arc<ServerState>) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let connection = state.registry.connect(remote.to_string(), outbound_tx);
    let span = info_span!("ws_connection", connection_id = connection.id());

    async move {
        let writer = tokio::spawn(
            async move {
                while let Some(text) = outbound_rx.recv().await {
                    if let Err(err) = sink.send(Message::Text(text.into())).await {
                        debug!(%err, "websocket write failed, writer stopping");
                        break;
                    }
                }
                sink.close().await.ok();
            }
            .in_current_span(),
        );

        let welcome = ControlFrame::Welcome(Welcome {
            server_id: state.server_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            timestamp: now_millis(),
        });
        if let Err(err) = connection.send_control(&welcome).await {
            warn!(%err, "failed to send welcome");
        }

        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => handle_text(&state, &connection, text.as_str()).await,
                Ok(Message::Binary(_)) => warn!("binary frame dropped"),
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_) | Message::Pong(_)) => connection.touch(),
                Err(err) => {
                    debug!(%err, "websocket read failed");
                    break;
                }
            }
        }

        state.registry.disconnect(&connection);
        writer.abort();
    }
    .instrument(span)
    .await;
}

async fn handle_text(state: &ServerState, connection: &Arc<Connection>, text: &str) {
    connection.touch();

    let frame = match classify_inbound_frame(text, |id| connection.rpc().is_pending(id)) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(%err, "inbound frame dropped");
            return;
        }
    };

    match frame {
        InboundFrame::Response(response) => {
            let rpc_id = response.id.clone();
            if !connection.rpc().handle_response(response) {
                debug!(rpc_id, "response for unknown or expired call dropped");
            }
        }
        InboundFrame::Request(request) => {
            warn!(method = %request.method, "agent-initiated request rejected");
            let reply = RpcResponse::failure(
                request.id,
                METHOD_NOT_FOUND,
                format!("method '{}' is not served by this endpoint", request.method),
            );
            send(connection, &reply).await;
        }
        InboundFrame::Control(control) => handle_control(state, connection, control).await,
    }
}

async fn handle_control(state: &ServerState, connection: &Arc<Connection>, frame: ControlFrame) {
    match frame {
        ControlFrame::Register(register) => {
            let ack = state
                .registry
                .register(connection, register, state.store.as_ref());
            send(connection, &ControlFrame::RegistrationAck(ack)).await;
        }
        ControlFrame::Ready => {
            if let Err(err) = state.registry.mark_ready(connection) {
                warn!(%err, "ready ignored");
            }
        }
        ControlFrame::Ping(Heartbeat { timestamp }) => {
            send(connection, &ControlFrame::Pong(Heartbeat { timestamp })).await;
        }
        ControlFrame::Pong(_) => debug!("pong received"),
        ControlFrame::Status(update) => state.dispatcher.handle_status(connection, update),
        ControlFrame::Welcome(_) | ControlFrame::RegistrationAck(_) => {
            warn!("server-bound frame of client-bound type dropped");
        }
        ControlFrame::Unrecognized => warn!("unrecognized control frame dropped"),
    }
}

async fn send<T: serde::Serialize>(connection: &Connection, frame: &T) {
    let result = match crate::protocol::encode_frame(frame) {
        Ok(text) => connection.send_text(text).await,
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        warn!(%err, "failed to queue outbound frame");
    }
}
