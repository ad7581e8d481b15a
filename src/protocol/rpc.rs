//! JSON-RPC 2.0 request/response frames and the `evaluate` method schema.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AppError, Result};

/// Value of the `jsonrpc` member on every RPC frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// The only method defined by the protocol.
pub const METHOD_EVALUATE: &str = "evaluate";

/// Standard JSON-RPC code: method does not exist.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Standard JSON-RPC code: invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Implementation-defined code: the tool raised an error.
pub const TOOL_EXECUTION_ERROR: i64 = -32000;
/// Implementation-defined code: the tool exceeded its time budget.
pub const TOOL_TIMEOUT: i64 = -32001;

/// Outbound or inbound JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
    /// Correlation identifier.
    pub id: String,
}

impl RpcRequest {
    /// Build a request with the protocol version filled in.
    #[must_use]
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
            id: id.into(),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC success or error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    /// Always `"2.0"`.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
    /// Correlation identifier of the request being answered.
    pub id: String,
}

fn default_version() -> String {
    JSONRPC_VERSION.into()
}

impl RpcResponse {
    /// Build a success response.
    #[must_use]
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            result: Some(result),
            error: None,
            id: id.into(),
        }
    }

    /// Build an error response.
    #[must_use]
    pub fn failure(id: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
            id: id.into(),
        }
    }

    /// Collapse the response into the call outcome.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` carrying the remote code and message when the
    /// response holds an error object.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(err) => Err(AppError::Rpc(format!("{} (code {})", err.message, err.code))),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Parameters of an `evaluate` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateParams {
    /// Evaluation definition identifier.
    pub evaluation_id: String,
    /// Evaluation display name.
    pub name: String,
    /// Page the agent should operate on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Tool the agent should run.
    pub tool: String,
    /// Tool arguments.
    #[serde(default)]
    pub input: Value,
    /// Time budget in milliseconds.
    pub timeout: u64,
    /// Free-form metadata forwarded unchanged.
    #[serde(default)]
    pub metadata: Value,
}

/// Result of an `evaluate` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    /// Tool output.
    #[serde(default)]
    pub output: Value,
    /// Agent-measured execution time in milliseconds. Fractional values
    /// from high-resolution timers are kept as sent.
    #[serde(default)]
    pub execution_time: f64,
    /// Agent-side status label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Intermediate steps recorded by the agent.
    #[serde(default)]
    pub steps: Vec<Value>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Value,
}
