#![forbid(unsafe_code)]

//! Operator CLI for a running `evalbridge` server.
//!
//! Connects to the IPC socket and sends one JSON command per invocation.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "evalbridge-ctl",
    about = "Operator CLI for the evalbridge evaluation server",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the server's `ipc_name` config).
    #[arg(long, default_value = "evalbridge")]
    ipc_name: String,

    /// Shared secret matching the server's `ipc_auth_token`.
    #[arg(long, env = "EVALBRIDGE_IPC_TOKEN")]
    auth_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show connection counters and tracked evaluation records.
    Status {
        /// Restrict records to one base or composite client id.
        client: Option<String>,
    },

    /// List clients known to the definition store.
    Clients,

    /// List registered connections.
    Connected,

    /// List the connected tabs of one client.
    Tabs {
        /// Base client id.
        client: String,
    },

    /// Run one evaluation on a client (base id picks the first ready tab).
    Run {
        /// Base or composite client id.
        client: String,
        /// Evaluation id.
        evaluation: String,
    },

    /// Run every evaluation a client owns.
    RunAll {
        /// Base or composite client id.
        client: String,
    },

    /// Run one evaluation on a specific tab.
    RunTab {
        /// Base client id.
        client: String,
        /// Tab id.
        tab: String,
        /// Evaluation id.
        evaluation: String,
    },

    /// Run an evaluation (or `all`) on every ready client.
    Eval {
        /// Evaluation id, or `all`.
        evaluation: String,
    },

    /// Reset a tracked evaluation back to pending.
    Reset {
        /// Base or composite client id.
        client: String,
        /// Evaluation id.
        evaluation: String,
    },
}

fn main() {
    let args = Cli::parse();

    let mut request_json = match &args.command {
        Command::Status { client } => {
            let mut req = serde_json::json!({ "command": "status" });
            if let Some(c) = client {
                req["client"] = serde_json::Value::String(c.clone());
            }
            req
        }
        Command::Clients => serde_json::json!({ "command": "clients" }),
        Command::Connected => serde_json::json!({ "command": "connected" }),
        Command::Tabs { client } => serde_json::json!({ "command": "tabs", "client": client }),
        Command::Run { client, evaluation } => {
            serde_json::json!({ "command": "run", "client": client, "evaluation": evaluation })
        }
        Command::RunAll { client } => serde_json::json!({ "command": "run_all", "client": client }),
        Command::RunTab {
            client,
            tab,
            evaluation,
        } => serde_json::json!({
            "command": "run_tab",
            "client": client,
            "tab": tab,
            "evaluation": evaluation,
        }),
        Command::Eval { evaluation } => {
            serde_json::json!({ "command": "eval", "evaluation": evaluation })
        }
        Command::Reset { client, evaluation } => {
            serde_json::json!({ "command": "reset", "client": client, "evaluation": evaluation })
        }
    };

    if let Some(token) = &args.auth_token {
        request_json["auth_token"] = serde_json::Value::String(token.clone());
    }

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!("Is evalbridge running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
