#![forbid(unsafe_code)]

//! Evaluation orchestration for browser-automation agents.
//!
//! Agents hold one WebSocket each, register under a `client:tab` identity,
//! and answer JSON-RPC `evaluate` calls. The server dispatches stored
//! evaluations to ready agents, correlates the replies, and classifies the
//! output with a judge model.

pub mod agent;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod errors;
pub mod ipc;
pub mod judge;
pub mod models;
pub mod protocol;
pub mod results;
pub mod rpc;
pub mod server;
pub mod store;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
