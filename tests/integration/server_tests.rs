//! End-to-end tests over a real WebSocket listener on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use evalbridge::agent::tools::{EchoTool, ToolRegistry};
use evalbridge::agent::{AgentConfig, AgentRuntime};
use evalbridge::dispatch::Dispatcher;
use evalbridge::models::evaluation::EvaluationStatus;
use evalbridge::protocol::{
    encode_frame, parse_inbound_frame, AckStatus, ControlFrame, Heartbeat, InboundFrame,
    RpcRequest, RpcResponse,
};
use evalbridge::server::{EvalServer, ServerState};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

use super::test_helpers::{client, dispatcher, evaluation, register_frame, store};

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_server() -> (EvalServer, Arc<Dispatcher>) {
    let store = store(vec![client("c1", Some("s"), vec![evaluation("e1")])]);
    let dispatcher = Arc::new(dispatcher(store));
    let state = Arc::new(ServerState::new("srv-test", Arc::clone(&dispatcher)));
    let server = EvalServer::bind("127.0.0.1:0".parse().expect("addr"), state)
        .await
        .expect("bind ephemeral");
    (server, dispatcher)
}

async fn connect(server: &EvalServer, path: &str) -> Socket {
    let url = format!("ws://{}{path}", server.local_addr());
    let (socket, _) = tokio_tungstenite::connect_async(url).await.expect("ws connect");
    socket
}

async fn recv_frame(socket: &mut Socket) -> InboundFrame {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame within 5 s")
            .expect("socket open")
            .expect("read ok");
        if let Message::Text(text) = message {
            return parse_inbound_frame(text.as_str()).expect("valid frame");
        }
    }
}

async fn send_frame(socket: &mut Socket, frame: &impl serde::Serialize) {
    socket
        .send(Message::Text(encode_frame(frame).expect("encodes").into()))
        .await
        .expect("send");
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 2 s");
}

// ── Handshake ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn welcome_register_ready_handshake() {
    let (server, dispatcher) = start_server().await;
    let mut socket = connect(&server, "/ws").await;

    let InboundFrame::Control(ControlFrame::Welcome(welcome)) = recv_frame(&mut socket).await else {
        panic!("welcome must be the first frame");
    };
    assert_eq!(welcome.server_id, "srv-test");

    send_frame(
        &mut socket,
        &ControlFrame::Register(register_frame("c1", Some("s"), Some("t1"))),
    )
    .await;
    let InboundFrame::Control(ControlFrame::RegistrationAck(ack)) = recv_frame(&mut socket).await
    else {
        panic!("expected registration_ack");
    };
    assert_eq!(ack.status, AckStatus::Accepted);
    assert_eq!(ack.evaluations_count, Some(1));

    send_frame(&mut socket, &ControlFrame::Ready).await;
    let registry = Arc::clone(dispatcher.registry());
    wait_until(|| registry.ready_connections().len() == 1).await;
    assert!(registry.get_client("c1:t1").is_ok());

    socket.close(None).await.expect("close");
    wait_until(|| registry.connection_count() == 0).await;
    server.stop();
}

#[tokio::test]
async fn rejected_register_keeps_socket_open_for_retry() {
    let (server, dispatcher) = start_server().await;
    let mut socket = connect(&server, "/").await;
    recv_frame(&mut socket).await;

    send_frame(&mut socket, &ControlFrame::Register(register_frame("c1", Some("bad"), None))).await;
    let InboundFrame::Control(ControlFrame::RegistrationAck(ack)) = recv_frame(&mut socket).await
    else {
        panic!("expected registration_ack");
    };
    assert_eq!(ack.status, AckStatus::Rejected);
    assert_eq!(ack.reason.as_deref(), Some("invalid secret key"));

    // Still usable: ping is answered on the same socket.
    send_frame(&mut socket, &ControlFrame::Ping(Heartbeat { timestamp: 99 })).await;
    assert_eq!(
        recv_frame(&mut socket).await,
        InboundFrame::Control(ControlFrame::Pong(Heartbeat { timestamp: 99 }))
    );
    assert_eq!(dispatcher.registry().connection_count(), 1);
    assert!(dispatcher.registry().list_connected().is_empty());
    server.stop();
}

#[tokio::test]
async fn agent_initiated_request_gets_method_not_found() {
    let (server, _dispatcher) = start_server().await;
    let mut socket = connect(&server, "/ws").await;
    recv_frame(&mut socket).await;

    send_frame(&mut socket, &RpcRequest::new("a-1", "listClients", json!({}))).await;

    let InboundFrame::Response(response) = recv_frame(&mut socket).await else {
        panic!("expected response");
    };
    assert_eq!(response.id, "a-1");
    assert_eq!(response.error.expect("error").code, -32601);
    server.stop();
}

// ── Dispatch over the wire ───────────────────────────────────────────────────

#[tokio::test]
async fn evaluate_round_trip_over_websocket() {
    let (server, dispatcher) = start_server().await;
    let mut socket = connect(&server, "/ws").await;
    recv_frame(&mut socket).await;
    send_frame(&mut socket, &ControlFrame::Register(register_frame("c1", Some("s"), None))).await;
    recv_frame(&mut socket).await;
    send_frame(&mut socket, &ControlFrame::Ready).await;
    let registry = Arc::clone(dispatcher.registry());
    wait_until(|| registry.ready_connections().len() == 1).await;

    let run = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.run("c1", "e1").await })
    };

    let InboundFrame::Request(request) = recv_frame(&mut socket).await else {
        panic!("expected evaluate request");
    };
    assert_eq!(request.method, "evaluate");
    assert_eq!(request.params["evaluationId"], "e1");
    send_frame(
        &mut socket,
        &RpcResponse::success(request.id, json!({"output": "Paris", "executionTime": 42})),
    )
    .await;

    let record = run.await.expect("task").expect("completes");
    assert_eq!(record.status, EvaluationStatus::Completed);
    let execution_time = record.response.expect("response").execution_time;
    assert!((execution_time - 42.0).abs() < f64::EPSILON);
    server.stop();
}

#[tokio::test]
async fn closing_socket_fails_in_flight_call() {
    let (server, dispatcher) = start_server().await;
    let mut socket = connect(&server, "/ws").await;
    recv_frame(&mut socket).await;
    send_frame(&mut socket, &ControlFrame::Register(register_frame("c1", Some("s"), None))).await;
    recv_frame(&mut socket).await;
    send_frame(&mut socket, &ControlFrame::Ready).await;
    let registry = Arc::clone(dispatcher.registry());
    wait_until(|| registry.ready_connections().len() == 1).await;

    let run = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.run("c1", "e1").await })
    };
    recv_frame(&mut socket).await;
    socket.close(None).await.expect("close");

    let err = run.await.expect("task").expect_err("connection went away");
    assert!(
        matches!(err, evalbridge::AppError::ConnectionClosed(_)),
        "got {err}"
    );
    assert_eq!(
        dispatcher.tracker().get("c1:default", "e1").expect("tracked").status,
        EvaluationStatus::Failed
    );
    server.stop();
}

#[tokio::test]
async fn agent_runtime_serves_evaluations_end_to_end() {
    let (server, dispatcher) = start_server().await;
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));
    let mut config = AgentConfig::new("c1");
    config.secret_key = Some("s".into());
    let runtime = Arc::new(AgentRuntime::new(config, tools));

    let url = format!("ws://{}/ws", server.local_addr());
    let agent = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.run_connection(&url).await })
    };
    let registry = Arc::clone(dispatcher.registry());
    wait_until(|| registry.ready_connections().len() == 1).await;
    assert!(runtime.is_ready());

    let record = dispatcher.run("c1", "e1").await.expect("completes");
    assert_eq!(record.status, EvaluationStatus::Completed);
    assert_eq!(
        record.response.expect("response").output,
        json!({"text": "Paris"})
    );

    agent.abort();
    server.stop();
}

// ── HTTP ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_returns_ok() {
    let (server, _dispatcher) = start_server().await;

    let resp = reqwest::get(format!("http://{}/health", server.local_addr()))
        .await
        .expect("HTTP GET /health");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.expect("body"), "ok");

    server.stop();
    server.wait().await.expect("listener closes cleanly");
}
