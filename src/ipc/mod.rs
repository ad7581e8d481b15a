//! Local IPC layer for `evalbridge-ctl` interaction.
//!
//! Provides a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! server that accepts JSON-line operator commands.

pub mod server;
