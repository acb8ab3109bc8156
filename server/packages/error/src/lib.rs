//! Error types shared by the claude-proxy gateway.
//!
//! Every failure the gateway can report maps onto a [`SandboxError`], which in
//! turn renders as an RFC 7807 [`ProblemDetails`] body with a fixed HTTP status.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    PathOutOfScope,
    FileNotFound,
    PayloadTooLarge,
    WorkspaceConflict,
    AgentSpawnFailed,
    AgentProcessExited,
    AgentTimedOut,
    StreamError,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:claude-proxy:error:invalid_request",
            Self::PathOutOfScope => "urn:claude-proxy:error:path_out_of_scope",
            Self::FileNotFound => "urn:claude-proxy:error:file_not_found",
            Self::PayloadTooLarge => "urn:claude-proxy:error:payload_too_large",
            Self::WorkspaceConflict => "urn:claude-proxy:error:workspace_conflict",
            Self::AgentSpawnFailed => "urn:claude-proxy:error:agent_spawn_failed",
            Self::AgentProcessExited => "urn:claude-proxy:error:agent_process_exited",
            Self::AgentTimedOut => "urn:claude-proxy:error:agent_timed_out",
            Self::StreamError => "urn:claude-proxy:error:stream_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::PathOutOfScope => "Path Out Of Scope",
            Self::FileNotFound => "File Not Found",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::WorkspaceConflict => "Workspace Conflict",
            Self::AgentSpawnFailed => "Agent Spawn Failed",
            Self::AgentProcessExited => "Agent Process Exited",
            Self::AgentTimedOut => "Agent Timed Out",
            Self::StreamError => "Stream Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::PathOutOfScope => 403,
            Self::FileNotFound => 404,
            Self::PayloadTooLarge => 413,
            Self::AgentTimedOut => 504,
            Self::WorkspaceConflict
            | Self::AgentSpawnFailed
            | Self::AgentProcessExited
            | Self::StreamError => 500,
        }
    }
}

/// RFC 7807 problem body returned by every non-streaming failure.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("file path out of session scope: {path}")]
    PathOutOfScope { path: String },
    #[error("file not found: {path}")]
    FileNotFound { path: String },
    #[error("file too large ({size} > {max} bytes)")]
    PayloadTooLarge { size: u64, max: u64 },
    #[error("workspace conflict: {message}")]
    WorkspaceConflict { message: String },
    #[error("failed to spawn agent {program}: {message}")]
    AgentSpawnFailed { program: String, message: String },
    #[error("{}", agent_exit_message(.exit_code, .stderr))]
    AgentProcessExited {
        exit_code: Option<i32>,
        stderr: Option<String>,
    },
    #[error("agent execution timed out")]
    AgentTimedOut { timeout_secs: u64 },
    #[error("stream error: {message}")]
    StreamError { message: String },
}

fn agent_exit_message(exit_code: &Option<i32>, stderr: &Option<String>) -> String {
    match (stderr.as_deref().map(str::trim), exit_code) {
        (Some(stderr), _) if !stderr.is_empty() => stderr.to_string(),
        (_, Some(code)) => format!("agent exited with code {code}"),
        (_, None) => "agent terminated by signal".to_string(),
    }
}

impl SandboxError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::PathOutOfScope { .. } => ErrorType::PathOutOfScope,
            Self::FileNotFound { .. } => ErrorType::FileNotFound,
            Self::PayloadTooLarge { .. } => ErrorType::PayloadTooLarge,
            Self::WorkspaceConflict { .. } => ErrorType::WorkspaceConflict,
            Self::AgentSpawnFailed { .. } => ErrorType::AgentSpawnFailed,
            Self::AgentProcessExited { .. } => ErrorType::AgentProcessExited,
            Self::AgentTimedOut { .. } => ErrorType::AgentTimedOut,
            Self::StreamError { .. } => ErrorType::StreamError,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        ProblemDetails::new(self.error_type(), Some(self.to_string()))
    }
}
