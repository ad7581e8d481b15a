//! Wire protocol shared by the server and the agent runtime.
//!
//! Every WebSocket text message carries exactly one JSON object. Two frame
//! families share the socket:
//!
//! | Family          | Discriminator                     | Types                         |
//! |-----------------|-----------------------------------|-------------------------------|
//! | Session control | `type`                            | [`ControlFrame`]              |
//! | RPC             | `id` + `method` / `result`/`error` | [`RpcRequest`], [`RpcResponse`] |
//!
//! [`parse_inbound_frame`] classifies a raw message. Receivers that own a
//! [`RpcCorrelator`](crate::rpc::RpcCorrelator) use
//! [`classify_inbound_frame`] instead, so a frame carrying an outstanding id
//! reaches the correlator even when it also has a `type`.

pub mod frames;
pub mod rpc;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

pub use frames::{
    AckStatus, Capabilities, ControlFrame, Heartbeat, Register, RegistrationAck, StatusUpdate,
    Welcome, DEFAULT_TAB_ID,
};
pub use rpc::{EvaluateParams, EvaluateResult, RpcErrorObject, RpcRequest, RpcResponse};

use crate::{AppError, Result};

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// JSON-RPC response (success or error).
    Response(RpcResponse),
    /// JSON-RPC request.
    Request(RpcRequest),
    /// Session-control frame.
    Control(ControlFrame),
}

/// Parse one raw text message into an [`InboundFrame`].
///
/// # Errors
///
/// - [`AppError::Protocol`]`("malformed json: …")`: not valid JSON.
/// - [`AppError::Protocol`]`("frame is not a json object")`: valid JSON of
///   the wrong shape.
/// - [`AppError::Protocol`]`("invalid <kind> frame: …")`: a known frame kind
///   with missing or mistyped fields.
pub fn parse_inbound_frame(text: &str) -> Result<InboundFrame> {
    classify_inbound_frame(text, |_| false)
}

/// Like [`parse_inbound_frame`], but any frame whose `id` satisfies
/// `is_pending` is read as a [`RpcResponse`] before the `type` discriminator
/// is consulted.
///
/// # Errors
///
/// See [`parse_inbound_frame`].
pub fn classify_inbound_frame(
    text: &str,
    is_pending: impl Fn(&str) -> bool,
) -> Result<InboundFrame> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| AppError::Protocol(format!("malformed json: {e}")))?;

    let Some(obj) = value.as_object() else {
        return Err(AppError::Protocol("frame is not a json object".into()));
    };

    if obj.get("id").and_then(Value::as_str).is_some_and(&is_pending) {
        if let Ok(response) = serde_json::from_value::<RpcResponse>(value.clone()) {
            return Ok(InboundFrame::Response(response));
        }
    }

    let has_type = obj.contains_key("type");
    let has_id = obj.contains_key("id");

    if !has_type && has_id && obj.contains_key("method") {
        let request: RpcRequest = serde_json::from_value(value)
            .map_err(|e| AppError::Protocol(format!("invalid rpc request frame: {e}")))?;
        return Ok(InboundFrame::Request(request));
    }

    if !has_type && has_id && (obj.contains_key("result") || obj.contains_key("error")) {
        let response: RpcResponse = serde_json::from_value(value)
            .map_err(|e| AppError::Protocol(format!("invalid rpc response frame: {e}")))?;
        return Ok(InboundFrame::Response(response));
    }

    let Some(kind) = obj.get("type").and_then(Value::as_str).map(str::to_owned) else {
        return Err(AppError::Protocol(
            "frame has neither an rpc id nor a type".into(),
        ));
    };

    let frame: ControlFrame = serde_json::from_value(value)
        .map_err(|e| AppError::Protocol(format!("invalid {kind} frame: {e}")))?;

    if frame == ControlFrame::Unrecognized {
        debug!(kind, "protocol: unrecognized control frame type");
    }

    Ok(InboundFrame::Control(frame))
}

/// Serialize any frame to its single-line wire form.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] if serialization fails.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String> {
    serde_json::to_string(frame)
        .map_err(|e| AppError::Protocol(format!("failed to serialise frame: {e}")))
}

/// Milliseconds since the Unix epoch, as carried in `timestamp` fields.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
