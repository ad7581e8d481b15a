//! Unit tests for `RpcCorrelator`: id matching, timeouts, and cancellation.

use std::sync::Arc;
use std::time::Duration;

use evalbridge::protocol::rpc::TOOL_EXECUTION_ERROR;
use evalbridge::protocol::{RpcRequest, RpcResponse};
use evalbridge::rpc::RpcCorrelator;
use evalbridge::AppError;
use serde_json::json;
use tokio::sync::mpsc;

fn correlator() -> (Arc<RpcCorrelator>, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(16);
    (Arc::new(RpcCorrelator::new("c1:default", tx)), rx)
}

async fn next_request(rx: &mut mpsc::Receiver<String>) -> RpcRequest {
    let text = rx.recv().await.expect("request frame written");
    serde_json::from_str(&text).expect("request frame is json-rpc")
}

#[tokio::test]
async fn response_resolves_matching_call() {
    let (rpc, mut rx) = correlator();
    let caller = Arc::clone(&rpc);
    let call = tokio::spawn(async move {
        caller
            .call("evaluate", json!({"tool": "echo"}), Duration::from_secs(5))
            .await
    });

    let request = next_request(&mut rx).await;
    assert_eq!(request.method, "evaluate");
    assert!(request.id.starts_with("rpc-"));
    assert!(rpc.is_pending(&request.id));

    assert!(rpc.handle_response(RpcResponse::success(request.id.clone(), json!({"output": "Paris"}))));

    let value = call.await.expect("task").expect("call succeeds");
    assert_eq!(value["output"], "Paris");
    assert_eq!(rpc.pending_count(), 0);
}

#[tokio::test]
async fn error_response_fails_call_with_rpc_error() {
    let (rpc, mut rx) = correlator();
    let caller = Arc::clone(&rpc);
    let call = tokio::spawn(async move {
        caller.call("evaluate", json!({}), Duration::from_secs(5)).await
    });

    let request = next_request(&mut rx).await;
    rpc.handle_response(RpcResponse::failure(request.id, TOOL_EXECUTION_ERROR, "page crashed"));

    let err = call.await.expect("task").expect_err("call fails");
    assert!(matches!(err, AppError::Rpc(ref msg) if msg.contains("page crashed")));
}

#[tokio::test]
async fn unknown_response_id_is_ignored() {
    let (rpc, _rx) = correlator();
    assert!(!rpc.handle_response(RpcResponse::success("rpc-0-deadbeef", json!(null))));
}

#[tokio::test(start_paused = true)]
async fn call_times_out_and_late_response_is_dropped() {
    let (rpc, mut rx) = correlator();
    let caller = Arc::clone(&rpc);
    let call = tokio::spawn(async move {
        caller.call("evaluate", json!({}), Duration::from_millis(5000)).await
    });

    let request = next_request(&mut rx).await;
    let err = call.await.expect("task").expect_err("must time out");
    assert!(
        matches!(err, AppError::Timeout(ref msg) if msg.contains("timed out after 5000 ms")),
        "unexpected error: {err}"
    );

    assert!(!rpc.is_pending(&request.id));
    assert!(!rpc.handle_response(RpcResponse::success(request.id, json!({}))));
}

#[tokio::test]
async fn cancel_all_fails_every_pending_call() {
    let (rpc, mut rx) = correlator();
    let mut calls = Vec::new();
    for _ in 0..3 {
        let caller = Arc::clone(&rpc);
        calls.push(tokio::spawn(async move {
            caller.call("evaluate", json!({}), Duration::from_secs(60)).await
        }));
    }
    for _ in 0..3 {
        next_request(&mut rx).await;
    }
    assert_eq!(rpc.pending_count(), 3);
    assert_eq!(rpc.pending_calls().len(), 3);

    assert_eq!(rpc.cancel_all("connection closed"), 3);
    assert_eq!(rpc.cancel_all("connection closed"), 0, "idempotent");

    for call in calls {
        let err = call.await.expect("task").expect_err("cancelled");
        assert!(
            matches!(err, AppError::ConnectionClosed(ref msg) if msg.contains("connection closed")),
            "unexpected error: {err}"
        );
    }
}

#[tokio::test]
async fn closed_outbound_channel_fails_immediately() {
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let rpc = RpcCorrelator::new("c1:default", tx);

    let err = rpc
        .call("evaluate", json!({}), Duration::from_secs(5))
        .await
        .expect_err("no writer");
    assert!(matches!(err, AppError::ConnectionClosed(_)));
    assert_eq!(rpc.pending_count(), 0);
}

#[tokio::test]
async fn concurrent_calls_get_distinct_ids() {
    let (rpc, mut rx) = correlator();
    let mut calls = Vec::new();
    for _ in 0..5 {
        let caller = Arc::clone(&rpc);
        calls.push(tokio::spawn(async move {
            caller.call("evaluate", json!({}), Duration::from_secs(5)).await
        }));
    }

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(next_request(&mut rx).await.id);
    }
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 5);

    // Answer out of order.
    for id in ids.iter().rev() {
        assert!(rpc.handle_response(RpcResponse::success(id.clone(), json!({"id": id}))));
    }
    for call in calls {
        call.await.expect("task").expect("resolved");
    }
}
