//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keychain service under which runtime credentials are stored.
const KEYRING_SERVICE: &str = "evalbridge";

/// Dispatch pacing and default call windows.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DispatchConfig {
    /// RPC window applied when an evaluation does not declare its own.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Fixed delay between consecutive calls to the same connection in a batch.
    #[serde(default = "default_inter_call_delay_ms")]
    pub inter_call_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            inter_call_delay_ms: default_inter_call_delay_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    45_000
}

fn default_inter_call_delay_ms() -> u64 {
    1_000
}

/// OpenAI-compatible judge endpoint settings.
///
/// The API key is loaded at runtime via OS keychain or environment variable,
/// never from the TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct JudgeConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub endpoint: String,
    /// Model used when an evaluation does not name one.
    #[serde(default = "default_judge_model")]
    pub model: String,
    /// Sampling temperature passed to the judge.
    #[serde(default)]
    pub temperature: f32,
    /// API key (populated at runtime).
    #[serde(skip)]
    pub api_key: String,
}

fn default_judge_model() -> String {
    "gpt-4o-mini".into()
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8080
}

fn default_ipc_name() -> String {
    "evalbridge".into()
}

fn default_server_id() -> String {
    format!("evalbridge-{}", uuid::Uuid::new_v4())
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Interface the WebSocket listener binds to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Listener port; `0` binds an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Identifier announced in every `welcome` frame.
    #[serde(default = "default_server_id")]
    pub server_id: String,
    /// Directory holding one `*.toml` client definition per file.
    pub clients_dir: PathBuf,
    /// Directory for the JSONL evaluation result log; disabled when absent.
    #[serde(default)]
    pub results_dir: Option<PathBuf>,
    /// Named pipe / Unix socket identifier for `evalbridge-ctl`.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Shared secret required on IPC commands when set.
    #[serde(default)]
    pub ipc_auth_token: Option<String>,
    /// Dispatch pacing.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Judge settings; `llm-judge` validations fail when absent.
    #[serde(default)]
    pub judge: Option<JudgeConfig>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the judge API key from OS keychain with env-var fallback.
    ///
    /// A no-op when no `[judge]` section is configured.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither keychain nor env var provide
    /// the key.
    pub async fn load_credentials(&mut self) -> Result<()> {
        if let Some(judge) = self.judge.as_mut() {
            judge.api_key = load_credential("judge_api_key", "EVALBRIDGE_JUDGE_API_KEY").await?;
        }
        Ok(())
    }

    /// Socket address the WebSocket listener binds to.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `host:port` is not a valid address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|err| AppError::Config(format!("invalid listen address: {err}")))
    }

    fn validate(&mut self) -> Result<()> {
        if self.dispatch.default_timeout_ms == 0 {
            return Err(AppError::Config(
                "dispatch.default_timeout_ms must be greater than zero".into(),
            ));
        }

        if self.server_id.trim().is_empty() {
            return Err(AppError::Config("server_id must not be empty".into()));
        }

        let canonical = self
            .clients_dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("clients_dir invalid: {err}")))?;
        if !canonical.is_dir() {
            return Err(AppError::Config(format!(
                "clients_dir is not a directory: {}",
                canonical.display()
            )));
        }
        self.clients_dir = canonical;

        self.listen_addr()?;
        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env::var(env_key).map_err(|_| {
        AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))
    })
}
