use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{
    AgentCommand, GatewayConfig, DEFAULT_AGENT_BIN, DEFAULT_HOST, DEFAULT_MAX_FILE_BYTES,
    DEFAULT_PORT, DEFAULT_PROMPT_PREVIEW_CHARS, DEFAULT_TIMEOUT_SECS, DEFAULT_WORKDIR,
    MAX_TIMEOUT_SECS,
};
use crate::router::{build_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "claude-proxy")]
#[command(about = "HTTP gateway that runs the claude CLI in per-session sandboxes", version)]
pub struct Cli {
    #[arg(long, env = "CLAUDE_PROXY_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    #[arg(long, env = "CLAUDE_PROXY_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Base directory for session sandboxes.
    #[arg(long, env = "CLAUDE_PROXY_WORKDIR", default_value = DEFAULT_WORKDIR)]
    pub workdir: PathBuf,

    /// Default agent timeout when a request does not set one.
    #[arg(long, env = "CLAUDE_PROXY_TIMEOUT_SECONDS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_seconds: u64,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "CLAUDE_PROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(
        long,
        env = "CLAUDE_PROXY_PROMPT_PREVIEW_CHARS",
        default_value_t = DEFAULT_PROMPT_PREVIEW_CHARS
    )]
    pub prompt_preview_chars: usize,

    /// Upper bound for uploaded and downloaded files.
    #[arg(long, env = "CLAUDE_PROXY_MAX_FILE_BYTES", default_value_t = DEFAULT_MAX_FILE_BYTES)]
    pub max_file_bytes: u64,

    #[arg(long, env = "CLAUDE_PROXY_AGENT_BIN", default_value = DEFAULT_AGENT_BIN)]
    pub agent_bin: String,

    /// Extra argument passed to the agent before the generated flags. Repeatable.
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    pub agent_args: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

impl Cli {
    pub fn to_config(&self) -> Result<GatewayConfig, CliError> {
        if self.timeout_seconds == 0 {
            return Err(CliError::InvalidArgument(
                "--timeout-seconds must be positive".to_string(),
            ));
        }
        if self.timeout_seconds > MAX_TIMEOUT_SECS {
            return Err(CliError::InvalidArgument(format!(
                "--timeout-seconds must be at most {MAX_TIMEOUT_SECS}"
            )));
        }
        if self.max_file_bytes == 0 {
            return Err(CliError::InvalidArgument(
                "--max-file-bytes must be positive".to_string(),
            ));
        }
        if self.agent_bin.trim().is_empty() {
            return Err(CliError::InvalidArgument(
                "--agent-bin must not be empty".to_string(),
            ));
        }
        Ok(GatewayConfig {
            host: self.host.clone(),
            port: self.port,
            workdir: self.workdir.clone(),
            default_timeout: Duration::from_secs(self.timeout_seconds),
            log_level: self.log_level.clone(),
            prompt_preview_chars: self.prompt_preview_chars,
            max_file_bytes: self.max_file_bytes,
            agent: AgentCommand::new(self.agent_bin.clone())
                .with_leading_args(self.agent_args.iter().cloned()),
        })
    }
}

pub fn run_claude_proxy() -> Result<(), CliError> {
    let config = Cli::parse().to_config()?;
    init_logging(&config.log_level);
    run_server(config)
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_server(config: GatewayConfig) -> Result<(), CliError> {
    std::fs::create_dir_all(&config.workdir)?;
    let addr = config.bind_addr();

    tracing::info!(
        addr = %addr,
        workdir = %config.workdir.display(),
        agent = %config.agent.program,
        default_timeout_secs = config.default_timeout.as_secs(),
        max_file_bytes = config.max_file_bytes,
        "starting claude-proxy"
    );

    let router = build_router(AppState::new(config));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
