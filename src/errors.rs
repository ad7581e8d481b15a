//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed, unknown, or out-of-sequence protocol frame.
    Protocol(String),
    /// Client credentials were rejected.
    Unauthorized(String),
    /// An RPC call received no response within its window.
    Timeout(String),
    /// The remote peer answered an RPC call with a JSON-RPC error.
    Rpc(String),
    /// The connection carrying a call or command went away.
    ConnectionClosed(String),
    /// The target connection has not declared itself ready.
    NotReady(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// The judge call itself failed (distinct from a low score).
    Validation(String),
    /// Client definition store failure.
    Store(String),
    /// Agent-side tool failed or was not found.
    Tool(String),
    /// IPC communication failure.
    Ipc(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Rpc(msg) => write!(f, "rpc: {msg}"),
            Self::ConnectionClosed(msg) => write!(f, "connection closed: {msg}"),
            Self::NotReady(msg) => write!(f, "not ready: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::Store(msg) => write!(f, "store: {msg}"),
            Self::Tool(msg) => write!(f, "tool: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
