#![forbid(unsafe_code)]

//! Reference automation agent.
//!
//! Dials an `evalbridge` server, registers under a client/tab identity, and
//! serves `evaluate` calls with the built-in tools. Owns the redial policy:
//! after a dropped connection it retries with exponential backoff.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use rand::Rng;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use evalbridge::agent::{AgentConfig, AgentRuntime, ToolRegistry, HEARTBEAT_INTERVAL};
use evalbridge::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "evalbridge-agent", about = "Reference evaluation agent", version, long_about = None)]
struct Cli {
    /// Server WebSocket URL.
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    url: String,

    /// Base client id to register as.
    #[arg(long)]
    client_id: String,

    /// Client secret.
    #[arg(long, env = "EVALBRIDGE_SECRET_KEY")]
    secret_key: Option<String>,

    /// Tab id; the server default applies when omitted.
    #[arg(long)]
    tab_id: Option<String>,

    /// Declared parallelism.
    #[arg(long)]
    max_concurrency: Option<u32>,

    /// Seconds between heartbeat pings.
    #[arg(long, default_value_t = HEARTBEAT_INTERVAL.as_secs())]
    heartbeat_secs: u64,

    /// Consecutive failed dials before giving up (0 = retry forever).
    #[arg(long, default_value_t = 10)]
    max_attempts: u32,

    /// Initial redial delay in milliseconds.
    #[arg(long, default_value_t = 1000)]
    initial_backoff_ms: u64,

    /// Upper bound on the redial delay in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    max_backoff_ms: u64,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = AgentConfig {
        client_id: args.client_id.clone(),
        secret_key: args.secret_key.clone(),
        tab_id: args.tab_id.clone(),
        max_concurrency: args.max_concurrency,
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs.max(1)),
    };
    let runtime = AgentRuntime::new(config, ToolRegistry::with_builtin_tools()?);
    info!(client_id = %args.client_id, url = %args.url, "evalbridge agent starting");

    tokio::select! {
        result = redial(&runtime, &args) => result,
        () = shutdown_signal() => {
            info!("shutdown signal received");
            runtime.on_disconnect();
            Ok(())
        }
    }
}

/// Serve connections until the dial budget is exhausted.
async fn redial(runtime: &AgentRuntime, args: &Cli) -> Result<()> {
    let mut failures: u32 = 0;
    loop {
        match runtime.run_connection(&args.url).await {
            Ok(()) => {
                failures = 0;
                info!("connection closed, redialing");
            }
            Err(err) => {
                failures += 1;
                warn!(%err, attempt = failures, "dial failed");
                if args.max_attempts > 0 && failures >= args.max_attempts {
                    error!(attempts = failures, "giving up");
                    return Err(err);
                }
            }
        }

        let delay = backoff(failures, args.initial_backoff_ms, args.max_backoff_ms);
        tokio::time::sleep(delay).await;
    }
}

/// Exponential backoff with a little jitter, capped at `max_ms`.
fn backoff(failures: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let base = initial_ms.saturating_mul(1 << exponent).min(max_ms);
    let jitter = rand::thread_rng().gen_range(0..=base / 10);
    Duration::from_millis(base.saturating_add(jitter).min(max_ms))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "ctrl-c signal handler failed");
        std::future::pending::<()>().await;
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
