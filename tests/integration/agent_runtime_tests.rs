//! Integration tests for the agent-side protocol state machine.
//!
//! Frames are fed through `AgentRuntime::handle_text` and replies are read
//! back from the outbound queue, without a socket.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use evalbridge::agent::tools::{EchoTool, Tool, ToolCall, ToolOutput, ToolRegistry};
use evalbridge::agent::{AgentConfig, AgentRuntime};
use evalbridge::protocol::rpc::{INVALID_PARAMS, METHOD_NOT_FOUND, TOOL_EXECUTION_ERROR, TOOL_TIMEOUT};
use evalbridge::protocol::{
    encode_frame, parse_inbound_frame, ControlFrame, EvaluateResult, Heartbeat, InboundFrame,
    RegistrationAck, RpcRequest, RpcResponse, Welcome,
};
use evalbridge::AppError;
use serde_json::json;
use tokio::sync::mpsc;

/// Tool that sleeps before echoing.
struct SlowTool(Duration);

impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn execute(
        &self,
        call: ToolCall,
    ) -> Pin<Box<dyn Future<Output = evalbridge::Result<ToolOutput>> + Send + '_>> {
        let delay = self.0;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(ToolOutput {
                output: call.input,
                steps: vec![json!({"action": "wait"})],
            })
        })
    }
}

/// Tool that always fails.
struct BrokenTool;

impl Tool for BrokenTool {
    fn name(&self) -> &str {
        "broken"
    }

    fn execute(
        &self,
        _call: ToolCall,
    ) -> Pin<Box<dyn Future<Output = evalbridge::Result<ToolOutput>> + Send + '_>> {
        Box::pin(async { Err(AppError::Tool("element not found".into())) })
    }
}

fn runtime() -> AgentRuntime {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));
    tools.register(Arc::new(SlowTool(Duration::from_secs(10))));
    tools.register(Arc::new(BrokenTool));
    let mut config = AgentConfig::new("c1");
    config.secret_key = Some("s".into());
    config.tab_id = Some("t1".into());
    config.max_concurrency = Some(2);
    AgentRuntime::new(config, tools)
}

fn frame(value: &impl serde::Serialize) -> String {
    encode_frame(value).expect("encodes")
}

fn evaluate_request(id: &str, tool: &str, timeout: u64) -> String {
    frame(&RpcRequest::new(
        id,
        "evaluate",
        json!({
            "evaluationId": "e1",
            "name": "Capital",
            "tool": tool,
            "input": {"text": "Paris"},
            "timeout": timeout,
            "metadata": {"suite": "geo"},
        }),
    ))
}

async fn next_response(rx: &mut mpsc::Receiver<String>) -> RpcResponse {
    loop {
        let text = rx.recv().await.expect("frame queued");
        if let Ok(InboundFrame::Response(response)) = parse_inbound_frame(&text) {
            return response;
        }
    }
}

async fn registered_runtime() -> (AgentRuntime, mpsc::Sender<String>, mpsc::Receiver<String>) {
    let runtime = runtime();
    let (tx, mut rx) = mpsc::channel(32);
    runtime
        .handle_text(
            &frame(&ControlFrame::RegistrationAck(RegistrationAck::accepted("c1", 1))),
            &tx,
        )
        .await;
    let ready = rx.recv().await.expect("ready queued");
    assert_eq!(
        parse_inbound_frame(&ready).expect("parses"),
        InboundFrame::Control(ControlFrame::Ready)
    );
    (runtime, tx, rx)
}

// ── Handshake ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn welcome_triggers_register_with_capabilities() {
    let runtime = runtime();
    let (tx, mut rx) = mpsc::channel(8);

    let welcome = ControlFrame::Welcome(Welcome {
        server_id: "srv-1".into(),
        version: "1.0".into(),
        timestamp: 1,
    });
    runtime.handle_text(&frame(&welcome), &tx).await;

    assert_eq!(runtime.server_id().as_deref(), Some("srv-1"));
    let sent = rx.recv().await.expect("register queued");
    let InboundFrame::Control(ControlFrame::Register(register)) =
        parse_inbound_frame(&sent).expect("parses")
    else {
        panic!("expected register, got {sent}");
    };
    assert_eq!(register.client_id, "c1");
    assert_eq!(register.secret_key.as_deref(), Some("s"));
    assert_eq!(register.capabilities.tab_id.as_deref(), Some("t1"));
    assert_eq!(register.capabilities.max_concurrency, Some(2));
    assert_eq!(
        register.capabilities.tools,
        vec!["broken".to_owned(), "echo".to_owned(), "slow".to_owned()]
    );
}

#[tokio::test]
async fn accepted_ack_sends_ready() {
    let (runtime, _tx, _rx) = registered_runtime().await;
    assert!(runtime.is_registered());
    assert!(runtime.is_ready());
}

#[tokio::test]
async fn rejected_ack_leaves_runtime_unregistered() {
    let runtime = runtime();
    let (tx, mut rx) = mpsc::channel(8);

    runtime
        .handle_text(
            &frame(&ControlFrame::RegistrationAck(RegistrationAck::rejected(
                "c1",
                "invalid secret key",
            ))),
            &tx,
        )
        .await;

    assert!(!runtime.is_registered());
    assert!(!runtime.is_ready());
    assert!(rx.try_recv().is_err(), "no ready after rejection");
}

#[tokio::test]
async fn ping_is_answered_with_same_timestamp() {
    let runtime = runtime();
    let (tx, mut rx) = mpsc::channel(8);

    runtime
        .handle_text(&frame(&ControlFrame::Ping(Heartbeat { timestamp: 1234 })), &tx)
        .await;

    let pong = rx.recv().await.expect("pong queued");
    assert_eq!(
        parse_inbound_frame(&pong).expect("parses"),
        InboundFrame::Control(ControlFrame::Pong(Heartbeat { timestamp: 1234 }))
    );
}

#[tokio::test(start_paused = true)]
async fn heartbeat_pings_after_registration() {
    let runtime = runtime();
    let (tx, mut rx) = mpsc::channel(8);
    runtime
        .handle_text(
            &frame(&ControlFrame::RegistrationAck(RegistrationAck::accepted("c1", 0))),
            &tx,
        )
        .await;
    rx.recv().await.expect("ready");

    let ping = rx.recv().await.expect("heartbeat ping");
    assert!(matches!(
        parse_inbound_frame(&ping).expect("parses"),
        InboundFrame::Control(ControlFrame::Ping(_))
    ));

    runtime.on_disconnect();
    assert!(!runtime.is_registered());
}

// ── evaluate ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn evaluate_runs_tool_and_echoes_request_id() {
    let (runtime, tx, mut rx) = registered_runtime().await;

    runtime.handle_text(&evaluate_request("srv-1", "echo", 5000), &tx).await;

    let response = next_response(&mut rx).await;
    assert_eq!(response.id, "srv-1");
    let result: EvaluateResult =
        serde_json::from_value(response.into_result().expect("success")).expect("result shape");
    assert_eq!(result.output, json!({"text": "Paris"}));
    assert_eq!(result.status.as_deref(), Some("completed"));
    assert_eq!(result.metadata, json!({"suite": "geo"}));
    assert_eq!(runtime.in_flight_count(), 0);
}

#[tokio::test]
async fn unknown_tool_is_method_not_found() {
    let (runtime, tx, mut rx) = registered_runtime().await;

    runtime.handle_text(&evaluate_request("r1", "teleport", 5000), &tx).await;

    let response = next_response(&mut rx).await;
    assert_eq!(response.error.expect("error").code, METHOD_NOT_FOUND);
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let (runtime, tx, mut rx) = registered_runtime().await;

    runtime
        .handle_text(&frame(&RpcRequest::new("r1", "shutdown", json!({}))), &tx)
        .await;

    let response = next_response(&mut rx).await;
    assert_eq!(response.id, "r1");
    assert_eq!(response.error.expect("error").code, METHOD_NOT_FOUND);
}

#[tokio::test]
async fn malformed_params_are_invalid_params() {
    let (runtime, tx, mut rx) = registered_runtime().await;

    runtime
        .handle_text(&frame(&RpcRequest::new("r1", "evaluate", json!({"tool": 5}))), &tx)
        .await;

    let response = next_response(&mut rx).await;
    assert_eq!(response.error.expect("error").code, INVALID_PARAMS);
}

#[tokio::test]
async fn tool_failure_is_execution_error() {
    let (runtime, tx, mut rx) = registered_runtime().await;

    runtime.handle_text(&evaluate_request("r1", "broken", 5000), &tx).await;

    let error = next_response(&mut rx).await.error.expect("error");
    assert_eq!(error.code, TOOL_EXECUTION_ERROR);
    assert!(error.message.contains("element not found"));
}

#[tokio::test(start_paused = true)]
async fn tool_exceeding_budget_is_timeout_error() {
    let (runtime, tx, mut rx) = registered_runtime().await;

    runtime.handle_text(&evaluate_request("r1", "slow", 500), &tx).await;

    let error = next_response(&mut rx).await.error.expect("error");
    assert_eq!(error.code, TOOL_TIMEOUT);
    assert!(error.message.contains("500 ms"));
}

#[tokio::test(start_paused = true)]
async fn duplicate_request_id_is_refused_while_running() {
    let (runtime, tx, mut rx) = registered_runtime().await;

    runtime.handle_text(&evaluate_request("dup", "slow", 60_000), &tx).await;
    assert_eq!(runtime.in_flight_count(), 1);
    runtime.handle_text(&evaluate_request("dup", "slow", 60_000), &tx).await;

    let response = next_response(&mut rx).await;
    assert_eq!(response.id, "dup");
    assert_eq!(response.error.expect("error").code, INVALID_PARAMS);
    assert_eq!(runtime.in_flight_count(), 1);

    runtime.on_disconnect();
    assert_eq!(runtime.in_flight_count(), 0);
}

#[tokio::test]
async fn malformed_frame_is_dropped_quietly() {
    let (runtime, tx, mut rx) = registered_runtime().await;

    runtime.handle_text("{broken", &tx).await;

    assert!(rx.try_recv().is_err());
    assert!(runtime.is_ready());
}
