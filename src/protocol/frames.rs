//! Session-control frames discriminated by their `type` field.

use serde::{Deserialize, Serialize};

/// Tab identifier used when a client registers without one.
pub const DEFAULT_TAB_ID: &str = "default";

/// Closed union of session-control frames exchanged in both directions.
///
/// Decoding an unknown `type` yields [`ControlFrame::Unrecognized`] instead
/// of an error so that callers can log and drop it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Server greeting, sent immediately after the socket opens.
    Welcome(Welcome),
    /// Client credential and capability announcement.
    Register(Register),
    /// Server verdict on a `register` frame.
    RegistrationAck(RegistrationAck),
    /// Registered client is available for `evaluate` calls.
    Ready,
    /// Liveness check.
    Ping(Heartbeat),
    /// Liveness answer.
    Pong(Heartbeat),
    /// Proactive progress report for an in-flight evaluation.
    Status(StatusUpdate),
    /// Any `type` value not listed above.
    #[serde(other)]
    Unrecognized,
}

/// Payload of the `welcome` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    /// Identifier of the server instance.
    pub server_id: String,
    /// Server version string.
    pub version: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Capabilities declared by a registering client.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Tool names the agent can execute.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Concurrent `evaluate` calls the agent accepts; `1` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
    /// Agent build version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Browser tab this connection represents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<String>,
}

impl Capabilities {
    /// Declared concurrency, clamped to at least one.
    #[must_use]
    pub fn effective_max_concurrency(&self) -> usize {
        self.max_concurrency
            .map_or(1, |n| usize::try_from(n).unwrap_or(usize::MAX))
            .max(1)
    }

    /// Declared tab, or [`DEFAULT_TAB_ID`].
    #[must_use]
    pub fn tab_id_or_default(&self) -> &str {
        self.tab_id
            .as_deref()
            .filter(|tab| !tab.is_empty())
            .unwrap_or(DEFAULT_TAB_ID)
    }
}

/// Payload of the `register` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Register {
    /// Base client identifier.
    pub client_id: String,
    /// Shared secret for the client, if it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Declared capabilities.
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// Registration verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// Credentials valid; the connection is registered.
    Accepted,
    /// Credentials invalid; the socket stays open for a retry.
    Rejected,
}

/// Payload of the `registration_ack` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationAck {
    /// Base client identifier echoed back.
    pub client_id: String,
    /// Verdict.
    pub status: AckStatus,
    /// Rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Number of evaluations defined for the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluations_count: Option<usize>,
}

impl RegistrationAck {
    /// Build an `accepted` acknowledgement.
    #[must_use]
    pub fn accepted(client_id: &str, evaluations_count: usize) -> Self {
        Self {
            client_id: client_id.to_owned(),
            status: AckStatus::Accepted,
            reason: None,
            message: Some("registration accepted".into()),
            evaluations_count: Some(evaluations_count),
        }
    }

    /// Build a `rejected` acknowledgement.
    #[must_use]
    pub fn rejected(client_id: &str, reason: impl Into<String>) -> Self {
        Self {
            client_id: client_id.to_owned(),
            status: AckStatus::Rejected,
            reason: Some(reason.into()),
            message: None,
            evaluations_count: None,
        }
    }
}

/// Payload shared by `ping` and `pong`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Heartbeat {
    /// Milliseconds since the Unix epoch at the sender.
    #[serde(default)]
    pub timestamp: i64,
}

/// Payload of the `status` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    /// Evaluation the report refers to.
    pub evaluation_id: String,
    /// Free-form agent-side status label.
    pub status: String,
    /// Fractional progress in `0..=1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Human-readable progress message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
