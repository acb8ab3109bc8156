//! Gateway configuration.
//!
//! Built once at startup (see `cli.rs`) and handed to every component through
//! `AppState`; nothing in the crate reads the environment after that.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3457;
pub const DEFAULT_WORKDIR: &str = "/home/node/workspace/projects";
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
/// Longest run a request may ask for; larger values are clamped.
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_PROMPT_PREVIEW_CHARS: usize = 120;
pub const DEFAULT_MAX_FILE_BYTES: u64 = 20 * 1024 * 1024;
pub const DEFAULT_AGENT_BIN: &str = "claude";

/// Program (and any wrapper arguments) used to launch the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    /// Arguments placed before the generated agent flags.
    pub leading_args: Vec<String>,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self::new(DEFAULT_AGENT_BIN)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Base directory under which every sandbox root is created.
    pub workdir: PathBuf,
    pub default_timeout: Duration,
    pub log_level: String,
    pub prompt_preview_chars: usize,
    pub max_file_bytes: u64,
    pub agent: AgentCommand,
}

impl GatewayConfig {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            workdir: workdir.into(),
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            log_level: "info".to_string(),
            prompt_preview_chars: DEFAULT_PROMPT_PREVIEW_CHARS,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            agent: AgentCommand::default(),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Largest request body accepted by the router: a base64-encoded file of
    /// `max_file_bytes` plus room for the surrounding JSON.
    pub fn request_body_limit(&self) -> usize {
        let encoded = self.max_file_bytes.saturating_add(2) / 3 * 4;
        usize::try_from(encoded.saturating_add(64 * 1024)).unwrap_or(usize::MAX)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new(DEFAULT_WORKDIR)
    }
}

/// Escapes line breaks and truncates `text` for log output.
pub fn preview_text(text: &str, limit: usize) -> String {
    let escaped = text.replace('\r', "\\r").replace('\n', "\\n");
    if escaped.chars().count() <= limit {
        return escaped;
    }
    let mut out: String = escaped.chars().take(limit).collect();
    out.push_str("...");
    out
}
