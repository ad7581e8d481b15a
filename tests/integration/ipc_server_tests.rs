//! Integration tests for operator IPC command dispatch and authentication.

use std::sync::Arc;
use std::time::Duration;

use evalbridge::ipc::server::{handle_request, IpcRequest, IpcState};

use super::test_helpers::{
    client, dispatcher, evaluation, ready_connection, register_frame, spawn_agent, store,
    AgentScript,
};

fn state(auth_token: Option<&str>) -> IpcState {
    let store = store(vec![client("c1", None, vec![evaluation("e1")])]);
    IpcState {
        server_id: "srv-test".into(),
        dispatcher: Arc::new(dispatcher(store)),
        auth_token: auth_token.map(str::to_owned),
    }
}

fn request(command: &str, token: Option<&str>) -> IpcRequest {
    IpcRequest {
        auth_token: token.map(str::to_owned),
        ..IpcRequest::new(command)
    }
}

// ── Authentication ───────────────────────────────────────────────────────────

#[tokio::test]
async fn valid_token_is_accepted() {
    let state = state(Some("secret"));
    let response = handle_request(&request("status", Some("secret")), &state).await;
    assert!(response.ok, "{response:?}");
}

#[tokio::test]
async fn wrong_or_missing_token_is_unauthorized() {
    let state = state(Some("secret"));
    for token in [Some("nope"), None] {
        let response = handle_request(&request("status", token), &state).await;
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("unauthorized"));
    }
}

#[tokio::test]
async fn no_configured_token_allows_any_request() {
    let state = state(None);
    assert!(handle_request(&request("clients", None), &state).await.ok);
}

// ── Commands ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn status_reports_summary() {
    let state = state(None);
    let response = handle_request(&request("status", None), &state).await;
    let data = response.data.expect("data");
    assert_eq!(data["server_id"], "srv-test");
    assert_eq!(data["summary"]["connections"], 0);
    assert!(data["evaluations"].as_array().expect("array").is_empty());
}

#[tokio::test]
async fn clients_lists_definitions_with_connected_tabs() {
    let state = state(None);
    let dispatcher = &state.dispatcher;
    let (_connection, _rx) = ready_connection(
        dispatcher.registry(),
        dispatcher.store().as_ref(),
        register_frame("c1", None, Some("t1")),
    );

    let data = handle_request(&request("clients", None), &state)
        .await
        .data
        .expect("data");
    assert_eq!(data["clients"][0]["client_id"], "c1");
    assert_eq!(data["clients"][0]["evaluations"][0], "e1");
    assert_eq!(data["clients"][0]["connected_tabs"], 1);

    let tabs = handle_request(
        &IpcRequest {
            client: Some("c1".into()),
            ..IpcRequest::new("tabs")
        },
        &state,
    )
    .await
    .data
    .expect("data");
    assert_eq!(tabs["tabs"][0]["composite_id"], "c1:t1");
}

#[tokio::test]
async fn connected_lists_in_flight_calls() {
    let state = state(None);
    let dispatcher = Arc::clone(&state.dispatcher);
    let (connection, rx) = ready_connection(
        dispatcher.registry(),
        dispatcher.store().as_ref(),
        register_frame("c1", None, Some("t1")),
    );
    let _agent = spawn_agent(Arc::clone(&connection), rx, AgentScript::Silent);

    let run = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.run("c1", "e1").await })
    };
    for _ in 0..100 {
        if connection.rpc().pending_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let data = handle_request(&request("connected", None), &state)
        .await
        .data
        .expect("data");
    let entry = &data["connections"][0];
    assert_eq!(entry["composite_id"], "c1:t1");
    assert_eq!(entry["pending_calls"], 1);
    assert_eq!(entry["in_flight"][0]["method"], "evaluate");
    assert!(entry["in_flight"][0]["remaining_ms"].as_u64().expect("ms") <= 5000);

    dispatcher.registry().disconnect(&connection);
    assert!(run.await.expect("task").is_err());
}

#[tokio::test]
async fn run_requires_client_and_evaluation() {
    let state = state(None);
    let response = handle_request(
        &IpcRequest {
            client: Some("c1".into()),
            ..IpcRequest::new("run")
        },
        &state,
    )
    .await;
    assert!(!response.ok);
    assert_eq!(
        response.error.as_deref(),
        Some("missing required 'evaluation' field")
    );
}

#[tokio::test]
async fn run_executes_evaluation() {
    let state = state(None);
    let dispatcher = &state.dispatcher;
    let (connection, rx) = ready_connection(
        dispatcher.registry(),
        dispatcher.store().as_ref(),
        register_frame("c1", None, None),
    );
    let _agent = spawn_agent(
        connection,
        rx,
        AgentScript::Reply {
            output: serde_json::json!("Paris"),
            delay: Duration::from_millis(10),
        },
    );

    let response = handle_request(
        &IpcRequest {
            client: Some("c1".into()),
            evaluation: Some("e1".into()),
            ..IpcRequest::new("run")
        },
        &state,
    )
    .await;
    assert!(response.ok, "{response:?}");
    assert_eq!(response.data.expect("data")["status"], "completed");
}

#[tokio::test]
async fn eval_with_no_ready_clients_reports_error() {
    let state = state(None);
    let response = handle_request(&request("eval", None), &state).await;
    assert!(!response.ok);
    assert!(response
        .error
        .expect("error")
        .contains("no ready clients"));
}

#[tokio::test]
async fn reset_unknown_evaluation_reports_error() {
    let state = state(None);
    let response = handle_request(
        &IpcRequest {
            client: Some("c1".into()),
            evaluation: Some("e1".into()),
            ..IpcRequest::new("reset")
        },
        &state,
    )
    .await;
    assert!(!response.ok);
}

#[tokio::test]
async fn unknown_command_is_rejected() {
    let state = state(None);
    let response = handle_request(&request("explode", None), &state).await;
    assert_eq!(response.error.as_deref(), Some("unknown command: explode"));
}
