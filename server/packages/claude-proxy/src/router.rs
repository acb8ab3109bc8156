use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderName, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use base64::Engine;
use claude_proxy_error::{ErrorType, ProblemDetails, SandboxError};
use futures::{future, stream, StreamExt};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::config::{preview_text, GatewayConfig, MAX_TIMEOUT_SECS};
use crate::files::{
    read_download, resolve_download, save_upload, validate_upload, DownloadedFile, UploadedFile,
};
use crate::launcher::{build_command, launch, mode_label};
use crate::stream::{AgentRun, RunEvent, RunOutcome};
use crate::workspace::{Identity, SessionWorkspace};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson; charset=utf-8";
pub const PROXY_ERROR_TYPE: &str = "proxy_error";

const FILENAME_HEADER: &str = "x-filename";
const SESSION_ID_HEADER: &str = "x-session-id";
const BOT_ID_HEADER: &str = "x-bot-id";

#[derive(Debug)]
pub struct AppState {
    config: GatewayConfig,
    request_counter: AtomicU64,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            request_counter: AtomicU64::new(0),
        }
    }

    fn next_request_id(&self) -> String {
        let id = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{id:08x}")
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let body_limit = shared.config.request_body_limit();
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %req.method(),
                uri = %req.uri()
            )
        })
        .on_request(|_req: &Request<_>, span: &Span| {
            tracing::info!(parent: span, "request");
        })
        .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });

    let router = Router::new()
        .route("/", get(get_root))
        .route("/healthz", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/chat", post(post_chat))
        .route("/files/upload", post(upload_file))
        .route("/files/download", post(download_file))
        .fallback(not_found)
        .with_state(shared.clone())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(trace_layer);

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, post_chat, upload_file, download_file),
    components(
        schemas(
            HealthResponse,
            ChatRequest,
            ProxyErrorRecord,
            UploadRequest,
            UploadResponse,
            DownloadRequest,
            DownloadResponse,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "agent", description = "Agent execution"),
        (name = "files", description = "Session file transfer")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:3457")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Sandbox(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct HealthResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ChatRequest {
    #[serde(default, deserialize_with = "lenient_string")]
    pub prompt: Option<String>,
    /// Continue the most recent conversation in the sandbox. Accepts booleans,
    /// numbers and the usual yes/no spellings.
    #[serde(default, rename = "continue")]
    #[schema(value_type = Option<bool>)]
    pub continue_session: Option<Value>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub session_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bot_id: Option<String>,
    /// Whole seconds, capped at one day; non-positive values fall back to the
    /// server default.
    #[serde(default)]
    #[schema(value_type = Option<i64>)]
    pub timeout_seconds: Option<Value>,
}

/// Terminal record appended to a `/chat` stream when the run fails.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ProxyErrorRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    pub request_id: String,
    pub error: String,
}

impl ProxyErrorRecord {
    pub fn new(request_id: &str, error: impl Into<String>) -> Self {
        Self {
            record_type: PROXY_ERROR_TYPE.to_string(),
            request_id: request_id.to_string(),
            error: error.into(),
        }
    }

    fn to_line(&self) -> Bytes {
        match serde_json::to_vec(self) {
            Ok(mut line) => {
                line.push(b'\n');
                Bytes::from(line)
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to encode proxy_error record");
                Bytes::new()
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct UploadRequest {
    #[serde(default, deserialize_with = "lenient_string")]
    pub session_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bot_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub filename: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub content_base64: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct UploadResponse {
    pub ok: bool,
    /// Stored name; may carry a `_<n>` suffix when the requested name was taken.
    pub filename: String,
    pub file_path: String,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct DownloadRequest {
    #[serde(default, deserialize_with = "lenient_string")]
    pub session_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bot_id: Option<String>,
    /// Absolute path, sandbox-relative path or `file://` URI.
    #[serde(default, deserialize_with = "lenient_string")]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct DownloadResponse {
    pub ok: bool,
    pub filename: String,
    pub file_path: String,
    pub size: u64,
    pub content_base64: String,
}

const SERVER_INFO: &str = "\
This is a claude-proxy server. Available endpoints:\n\
  - GET  /                - Server info\n\
  - GET  /healthz         - Health check\n\
  - GET  /openapi.json    - OpenAPI document\n\
  - POST /chat            - Run the agent and stream its output as NDJSON\n\
  - POST /files/upload    - Store a file in the session sandbox\n\
  - POST /files/download  - Fetch a file from the session sandbox";

async fn get_root() -> &'static str {
    SERVER_INFO
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Server is healthy", body = HealthResponse)),
    tag = "meta"
)]
/// Health Check
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    post,
    path = "/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Agent stdout, one JSON document per line; failures end the stream with a proxy_error record", content_type = "application/x-ndjson", body = String),
        (status = 400, description = "Invalid request", body = ProblemDetails),
        (status = 500, description = "Session workspace unavailable", body = ProblemDetails)
    ),
    tag = "agent"
)]
/// Run Agent
///
/// Launches the agent inside the session sandbox and streams its stdout line
/// by line. Headers are committed before the outcome is known, so timeouts
/// and failures are reported in-band as a final `proxy_error` record.
async fn post_chat(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request_id = state.next_request_id();
    let config = &state.config;

    let prepared = prepare_chat(config, &body).map_err(|err| rejected(&request_id, "/chat", err))?;
    let PreparedChat {
        prompt,
        continuation,
        timeout,
        workspace,
    } = prepared;
    let identity = workspace.identity().key();

    tracing::info!(
        request_id = %request_id,
        identity = %identity,
        mode = mode_label(continuation),
        timeout_secs = timeout.as_secs(),
        prompt_len = prompt.chars().count(),
        prompt_preview = %preview_text(&prompt, config.prompt_preview_chars),
        "agent run started"
    );

    let args = build_command(&prompt, continuation);
    let body = match launch(&config.agent, &args, workspace.root()) {
        Ok(child) => {
            let context = RunContext {
                request_id,
                identity,
                preview_chars: config.prompt_preview_chars,
            };
            let lines = AgentRun::new(child, timeout)
                .into_stream()
                .filter_map(move |event| future::ready(context.render(event)))
                .map(Ok::<Bytes, Infallible>);
            Body::from_stream(lines)
        }
        Err(err) => {
            tracing::error!(
                request_id = %request_id,
                identity = %identity,
                error = %err,
                "agent spawn failed"
            );
            let line = ProxyErrorRecord::new(&request_id, err.to_string()).to_line();
            Body::from_stream(stream::iter([Ok::<Bytes, Infallible>(line)]))
        }
    };

    Ok(ndjson_response(body))
}

struct PreparedChat {
    prompt: String,
    continuation: bool,
    timeout: Duration,
    workspace: SessionWorkspace,
}

fn prepare_chat(config: &GatewayConfig, body: &Bytes) -> Result<PreparedChat, SandboxError> {
    let request: ChatRequest = parse_json_body(body)?;
    let prompt = request.prompt.as_deref().map(str::trim).unwrap_or_default();
    if prompt.is_empty() {
        return Err(SandboxError::InvalidRequest {
            message: "prompt is required".to_string(),
        });
    }
    let continuation = parse_continue(request.continue_session.as_ref());
    let timeout = parse_timeout(request.timeout_seconds.as_ref(), config.default_timeout)?;
    let identity = Identity::new(request.bot_id.as_deref(), request.session_id.as_deref());
    let workspace = SessionWorkspace::resolve(config, &identity)?;
    Ok(PreparedChat {
        prompt: prompt.to_string(),
        continuation,
        timeout,
        workspace,
    })
}

struct RunContext {
    request_id: String,
    identity: String,
    preview_chars: usize,
}

impl RunContext {
    fn render(&self, event: RunEvent) -> Option<Bytes> {
        match event {
            RunEvent::Line(mut line) => {
                line.push('\n');
                Some(Bytes::from(line))
            }
            RunEvent::Finished(outcome) => {
                self.log_outcome(&outcome);
                outcome
                    .error_message()
                    .map(|message| ProxyErrorRecord::new(&self.request_id, message).to_line())
            }
        }
    }

    fn log_outcome(&self, outcome: &RunOutcome) {
        let duration_ms = outcome.duration().as_millis();
        let lines = outcome.lines();
        match outcome {
            RunOutcome::Succeeded { .. } => tracing::info!(
                request_id = %self.request_id,
                identity = %self.identity,
                duration_ms,
                lines,
                "agent run finished"
            ),
            RunOutcome::Failed {
                exit_code, stderr, ..
            } => tracing::warn!(
                request_id = %self.request_id,
                identity = %self.identity,
                duration_ms,
                lines,
                exit_code = ?exit_code,
                stderr = %preview_text(stderr, self.preview_chars),
                "agent run failed"
            ),
            RunOutcome::TimedOut { timeout, .. } => tracing::warn!(
                request_id = %self.request_id,
                identity = %self.identity,
                duration_ms,
                lines,
                timeout_secs = timeout.as_secs(),
                "agent run timed out"
            ),
        }
    }
}

fn ndjson_response(body: Body) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        body,
    )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/files/upload",
    request_body(
        content = UploadRequest,
        description = "JSON with base64 content, or raw bytes with x-filename, x-session-id and x-bot-id headers"
    ),
    responses(
        (status = 200, description = "File stored", body = UploadResponse),
        (status = 400, description = "Invalid request", body = ProblemDetails),
        (status = 413, description = "File too large", body = ProblemDetails)
    ),
    tag = "files"
)]
/// Upload File
///
/// Stores a file in the session's `.files/` directory without overwriting
/// existing files.
async fn upload_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UploadResponse>, ApiError> {
    let request_id = state.next_request_id();
    let config = &state.config;

    let result = if headers.contains_key(FILENAME_HEADER) {
        store_raw_upload(config, &headers, &body)
    } else {
        store_json_upload(config, &body)
    };
    let (identity, uploaded) = result.map_err(|err| rejected(&request_id, "/files/upload", err))?;

    tracing::info!(
        request_id = %request_id,
        identity = %identity.key(),
        requested = %uploaded.requested_name,
        name = %uploaded.stored_name,
        bytes = uploaded.size,
        path = %uploaded.path.display(),
        "file uploaded"
    );
    Ok(Json(UploadResponse {
        ok: true,
        filename: uploaded.stored_name,
        file_path: uploaded.path.to_string_lossy().into_owned(),
    }))
}

fn store_json_upload(
    config: &GatewayConfig,
    body: &Bytes,
) -> Result<(Identity, UploadedFile), SandboxError> {
    let request: UploadRequest = parse_json_body(body)?;
    let filename = request.filename.as_deref().map(str::trim).unwrap_or_default();
    if filename.is_empty() {
        return Err(SandboxError::InvalidRequest {
            message: "filename is required".to_string(),
        });
    }
    let encoded = request
        .content_base64
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    if encoded.is_empty() {
        return Err(SandboxError::InvalidRequest {
            message: "content_base64 is required".to_string(),
        });
    }
    let content = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|err| SandboxError::InvalidRequest {
            message: format!("invalid base64 content: {err}"),
        })?;
    validate_upload(filename, &content, config.max_file_bytes)?;

    let identity = Identity::new(request.bot_id.as_deref(), request.session_id.as_deref());
    let workspace = SessionWorkspace::resolve(config, &identity)?;
    let uploaded = save_upload(&workspace, filename, &content, config.max_file_bytes)?;
    Ok((identity, uploaded))
}

fn store_raw_upload(
    config: &GatewayConfig,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<(Identity, UploadedFile), SandboxError> {
    let filename = header_str(headers, FILENAME_HEADER).unwrap_or_default();
    if filename.trim().is_empty() {
        return Err(SandboxError::InvalidRequest {
            message: "x-filename header is required".to_string(),
        });
    }
    validate_upload(filename, body, config.max_file_bytes)?;
    let identity = Identity::new(
        header_str(headers, BOT_ID_HEADER),
        header_str(headers, SESSION_ID_HEADER),
    );
    let workspace = SessionWorkspace::resolve(config, &identity)?;
    let uploaded = save_upload(&workspace, filename, body, config.max_file_bytes)?;
    Ok((identity, uploaded))
}

#[utoipa::path(
    post,
    path = "/files/download",
    request_body = DownloadRequest,
    responses(
        (status = 200, description = "File content", body = DownloadResponse),
        (status = 400, description = "Invalid request", body = ProblemDetails),
        (status = 403, description = "Path outside the session sandbox", body = ProblemDetails),
        (status = 404, description = "File not found", body = ProblemDetails),
        (status = 413, description = "File too large", body = ProblemDetails)
    ),
    tag = "files"
)]
/// Download File
///
/// Returns a file from the session sandbox as base64. The path may be
/// absolute, relative to the sandbox root, or a `file://` URI.
async fn download_file(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<DownloadResponse>, ApiError> {
    let request_id = state.next_request_id();
    let config = &state.config;

    let (identity, file) = fetch_download(config, &body)
        .map_err(|err| rejected(&request_id, "/files/download", err))?;

    let size = file.content.len() as u64;
    tracing::info!(
        request_id = %request_id,
        identity = %identity.key(),
        name = %file.filename,
        bytes = size,
        path = %file.path.display(),
        "file downloaded"
    );
    Ok(Json(DownloadResponse {
        ok: true,
        filename: file.filename,
        file_path: file.path.to_string_lossy().into_owned(),
        size,
        content_base64: base64::engine::general_purpose::STANDARD.encode(&file.content),
    }))
}

fn fetch_download(
    config: &GatewayConfig,
    body: &Bytes,
) -> Result<(Identity, DownloadedFile), SandboxError> {
    let request: DownloadRequest = parse_json_body(body)?;
    let file_path = request.file_path.as_deref().map(str::trim).unwrap_or_default();
    if file_path.is_empty() {
        return Err(SandboxError::InvalidRequest {
            message: "file_path is required".to_string(),
        });
    }
    let identity = Identity::new(request.bot_id.as_deref(), request.session_id.as_deref());
    let workspace = SessionWorkspace::resolve(config, &identity)?;
    let target = resolve_download(&workspace, file_path)?;
    let file = read_download(&target, config.max_file_bytes)?;
    Ok((identity, file))
}

fn rejected(request_id: &str, route: &str, err: SandboxError) -> ApiError {
    let status = err.error_type().status_code();
    if status >= 500 {
        tracing::error!(request_id = %request_id, route, status, error = %err, "request failed");
    } else {
        tracing::warn!(request_id = %request_id, route, status, error = %err, "request rejected");
    }
    err.into()
}

fn parse_json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, SandboxError> {
    if body.is_empty() {
        return Err(SandboxError::InvalidRequest {
            message: "empty request body".to_string(),
        });
    }
    serde_json::from_slice(body).map_err(|err| SandboxError::InvalidRequest {
        message: format!("invalid JSON: {err}"),
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Accepts strings, numbers and booleans for string fields; `null` is absent.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(value)) => Some(value),
        Some(other) => Some(other.to_string()),
    })
}

fn parse_continue(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(text)) => {
            let text = text.trim().to_ascii_lowercase();
            match text.as_str() {
                "1" | "true" | "yes" | "y" | "on" => true,
                "0" | "false" | "no" | "n" | "off" | "" => false,
                _ => true,
            }
        }
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(fields)) => !fields.is_empty(),
    }
}

fn parse_timeout(value: Option<&Value>, default: Duration) -> Result<Duration, SandboxError> {
    let Some(value) = value else {
        return Ok(default);
    };
    let seconds = match value {
        Value::Bool(flag) => Some(i64::from(*flag)),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|n| n.is_finite()).map(|n| n.trunc() as i64)),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>().ok().or_else(|| {
                text.parse::<f64>()
                    .ok()
                    .filter(|n| n.is_finite())
                    .map(|n| n.trunc() as i64)
            })
        }
        _ => None,
    };
    match seconds {
        Some(seconds) if seconds > 0 => Ok(Duration::from_secs(
            (seconds as u64).min(MAX_TIMEOUT_SECS),
        )),
        Some(_) => Ok(default),
        None => Err(SandboxError::InvalidRequest {
            message: "invalid timeout_seconds".to_string(),
        }),
    }
}
