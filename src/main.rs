#![forbid(unsafe_code)]

//! Evaluation orchestration server binary.
//!
//! Bootstraps configuration, loads client definitions, and starts the agent
//! WebSocket listener and the IPC server for `evalbridge-ctl`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use evalbridge::config::GlobalConfig;
use evalbridge::directory::ConnectionRegistry;
use evalbridge::dispatch::Dispatcher;
use evalbridge::ipc::server::{spawn_ipc_server, IpcState};
use evalbridge::judge::openai::OpenAiJudge;
use evalbridge::results::JsonlResultWriter;
use evalbridge::server::{EvalServer, ServerState};
use evalbridge::store::watcher::ClientStoreWatcher;
use evalbridge::store::FileClientStore;
use evalbridge::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "evalbridge", about = "Evaluation orchestration server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("evalbridge server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    config.load_credentials().await?;
    let addr = config.listen_addr()?;
    info!("configuration loaded");

    // ── Client definitions ──────────────────────────────
    let store = Arc::new(FileClientStore::load(&config.clients_dir)?);
    let _watcher = match ClientStoreWatcher::start(Arc::clone(&store)) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(%err, "client definitions will not hot-reload");
            None
        }
    };

    // ── Dispatcher and collaborators ────────────────────
    let registry = Arc::new(ConnectionRegistry::new());
    let mut dispatcher = Dispatcher::new(
        Arc::clone(&registry),
        store,
        config.dispatch.clone(),
    );
    match &config.judge {
        Some(judge) if !judge.api_key.is_empty() => {
            dispatcher = dispatcher.with_judge(Arc::new(OpenAiJudge::from_config(judge)?));
            info!(model = %judge.model, "judge configured");
        }
        Some(_) => warn!("judge configured without an api key; llm-judge evaluations will fail"),
        None => info!("no judge configured; llm-judge evaluations will fail"),
    }
    if let Some(dir) = &config.results_dir {
        dispatcher = dispatcher.with_results(Arc::new(JsonlResultWriter::new(dir.clone())?));
        info!(dir = %dir.display(), "result log enabled");
    }
    let dispatcher = Arc::new(dispatcher);

    // ── Start listeners ─────────────────────────────────
    let ct = CancellationToken::new();
    let ipc_state = Arc::new(IpcState {
        server_id: config.server_id.clone(),
        dispatcher: Arc::clone(&dispatcher),
        auth_token: config.ipc_auth_token.clone(),
    });
    let ipc_handle = spawn_ipc_server(&config.ipc_name, ipc_state, ct.clone())?;

    let state = Arc::new(ServerState::new(config.server_id.clone(), dispatcher));
    let server = EvalServer::bind(addr, state).await?;
    info!(addr = %server.local_addr(), server_id = %config.server_id, "evalbridge ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    server.stop();
    ct.cancel();

    if let Err(err) = server.wait().await {
        error!(%err, "listener stopped with an error");
    }
    if let Err(err) = ipc_handle.await {
        error!(%err, "ipc server task failed");
    }
    info!(open_connections = registry.connection_count(), "evalbridge shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
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
