use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::config::Settings;
use crate::errors::{RunError, UploadError};
use crate::jobs::log_tail::{self, LogTail};
use crate::jobs::{CommandSpec, JobSupervisor, RunRegistry, RunUpdate};
use crate::research::sink::{self, BlobSink, MARKDOWN_CONTENT_TYPE};
use crate::util::{compact_timestamp, preview};

const PREVIEW_CHARS: usize = 100;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub registry: RunRegistry,
    pub supervisor: JobSupervisor,
    /// Research job command; the research content is appended per run.
    pub command: CommandSpec,
    pub log_dir: PathBuf,
    /// Where research documents are read back from; `None` without credentials.
    pub storage: Option<Arc<dyn BlobSink>>,
    pub settings: Settings,
}

impl AppState {
    pub fn new(registry: RunRegistry, command: CommandSpec, settings: Settings) -> Self {
        Self {
            supervisor: JobSupervisor::new(registry.clone()),
            registry,
            command,
            log_dir: settings.jobs.log_dir.clone(),
            storage: sink::configured(&settings.storage),
            settings,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub struct StartRequest {
    #[serde(default)]
    pub research_content: Option<String>,
}

#[derive(Deserialize)]
pub struct StatusQuery {
    pub run_id: Option<String>,
}

#[derive(Deserialize)]
pub struct LogQuery {
    pub run_id: Option<String>,
    pub bytes: Option<String>,
}

#[derive(Deserialize)]
pub struct BlobsQuery {
    pub run_folder: Option<String>,
}

#[derive(Deserialize)]
pub struct DownloadQuery {
    pub name: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
    /// Submission refused; body is `{"status": code, "detail": detail}`.
    Rejected {
        status: StatusCode,
        code: &'static str,
        detail: String,
    },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::Rejected {
                status,
                code,
                detail,
            } => {
                return (status, Json(json!({"status": code, "detail": detail}))).into_response();
            }
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::NotFound { .. } => ApiError::NotFound("blob_not_found".to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::RunNotFound { .. } => ApiError::NotFound("run_not_found".to_string()),
            RunError::DuplicateRun { .. } => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/", get(index))
        .route("/start", post(start_run))
        .route("/status", get(run_status))
        .route("/log", get(run_log))
        .route("/blobs", get(list_blobs))
        .route("/blob/download", get(download_blob))
        .route("/debug", get(debug_info))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn index(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let running = state.registry.any_running()?;
    Ok(Json(json!({ "running": running })))
}

async fn start_run(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: StartRequest = serde_json::from_slice(&body).unwrap_or_default();
    let content = request
        .research_content
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if content.is_empty() {
        return Err(ApiError::Rejected {
            status: StatusCode::BAD_REQUEST,
            code: "missing_content",
            detail: "Research content is required".to_string(),
        });
    }

    let executable = &state.command.executable;
    if !executable.exists() {
        return Err(ApiError::Rejected {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "missing_executable",
            detail: executable.display().to_string(),
        });
    }

    tokio::fs::create_dir_all(&state.log_dir)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to create log directory: {}", e)))?;

    let run_id = Uuid::new_v4().simple().to_string();
    let log_path = state
        .log_dir
        .join(format!("{}_{}.log", run_id, compact_timestamp(Utc::now())));

    state.registry.create(run_id.as_str(), &log_path)?;
    state
        .registry
        .update(&run_id, RunUpdate::preview(preview(&content, PREVIEW_CHARS)))?;
    state
        .supervisor
        .submit(&run_id, &state.command, &log_path, content)?;
    info!(run_id = %run_id, log = %log_path.display(), "Research run submitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "started",
            "run_id": run_id,
            "log": log_path,
        })),
    ))
}

async fn run_status(
    State(state): State<SharedState>,
    Query(query): Query<StatusQuery>,
) -> Result<Response, ApiError> {
    if let Some(run_id) = query.run_id.filter(|id| !id.is_empty()) {
        let record = state.registry.require(&run_id)?;
        return Ok(Json(record.view()).into_response());
    }

    let runs: serde_json::Map<String, serde_json::Value> = state
        .registry
        .list_summary()?
        .into_iter()
        .map(|run| {
            (
                run.run_id,
                json!({
                    "status": run.status,
                    "start": run.start_time,
                    "log": run.log_path,
                }),
            )
        })
        .collect();
    Ok(Json(json!({ "runs": runs })).into_response())
}

async fn run_log(
    State(state): State<SharedState>,
    Query(query): Query<LogQuery>,
) -> Result<Response, ApiError> {
    let Some(run_id) = query.run_id.filter(|id| !id.is_empty()) else {
        return Err(ApiError::BadRequest("run_id is required".to_string()));
    };
    let record = state.registry.require(&run_id)?;
    let bytes = log_tail::tail_bytes(query.bytes.as_deref());

    match log_tail::read_tail(&record.log_path, bytes).await {
        Ok(LogTail::Content(text)) => Ok(text.into_response()),
        Ok(LogTail::Missing) => Ok(format!(
            "Log file not found: {}\nRun status: {}",
            record.log_path.display(),
            record.status
        )
        .into_response()),
        Err(e) => Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to read log file: {}", e),
        )
            .into_response()),
    }
}

fn storage(state: &AppState) -> Result<&dyn BlobSink, ApiError> {
    state
        .storage
        .as_deref()
        .ok_or_else(|| ApiError::Internal("no_storage_credentials".to_string()))
}

async fn list_blobs(
    State(state): State<SharedState>,
    Query(query): Query<BlobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(run_folder) = query.run_folder.filter(|f| !f.is_empty()) else {
        return Err(ApiError::BadRequest("missing run_folder".to_string()));
    };
    let sink = storage(&state)?;
    let prefix = format!("{}/", run_folder.trim_end_matches('/'));
    let blobs = sink.list(&state.settings.storage.container, &prefix).await?;
    Ok(Json(json!({ "blobs": blobs })))
}

async fn download_blob(
    State(state): State<SharedState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let Some(name) = query.name.filter(|n| !n.is_empty()) else {
        return Err(ApiError::BadRequest("missing name".to_string()));
    };
    let sink = storage(&state)?;
    let bytes = sink.get(&state.settings.storage.container, &name).await?;

    let filename = Path::new(&name)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.clone());
    Ok((
        [
            (header::CONTENT_TYPE, MARKDOWN_CONTENT_TYPE.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", filename),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn debug_info(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let settings = &state.settings;
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    Ok(Json(json!({
        "executable": state.command.executable,
        "executable_exists": state.command.executable.exists(),
        "command_args": state.command.args,
        "cwd": cwd,
        "log_dir": state.log_dir,
        "container": settings.storage.container,
        "agent_endpoint_set": settings.agent.endpoint.is_some(),
        "model_set": settings.agent.model.is_some(),
        "deep_research_model_set": settings.agent.deep_research_model.is_some(),
        "bing_connection_set": settings.agent.bing_connection_id.is_some(),
        "storage_endpoint": settings.storage.blob_endpoint(),
        "storage_configured": state.storage.is_some(),
        "local_output_dir": settings.storage.local_dir,
        "active_runs": state.registry.running_count()?,
        "runs": state.registry.list_summary()?,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::RunStatus;
    use crate::research::testing::MemorySink;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_state(dir: &TempDir, command: CommandSpec) -> SharedState {
        let mut settings = Settings::default();
        settings.jobs.log_dir = dir.path().join("logs");
        Arc::new(AppState::new(RunRegistry::new(), command, settings))
    }

    fn state_with_storage(dir: &TempDir, sink: Arc<MemorySink>) -> SharedState {
        let mut settings = Settings::default();
        settings.jobs.log_dir = dir.path().join("logs");
        let mut state = AppState::new(RunRegistry::new(), echo_command(), settings);
        state.storage = Some(sink);
        Arc::new(state)
    }

    async fn stored_run() -> Arc<MemorySink> {
        let sink = Arc::new(MemorySink::default());
        for (path, body) in [
            ("research_run_1/research_step_01_a.md", "# Step\nalpha"),
            ("research_run_1/final_research_summary_b.md", "# Final\nomega"),
            ("research_run_2/other.md", "elsewhere"),
        ] {
            sink.put("research-summaries", path, body.as_bytes().to_vec(), MARKDOWN_CONTENT_TYPE)
                .await
                .unwrap();
        }
        sink
    }

    fn echo_command() -> CommandSpec {
        CommandSpec::new("/bin/sh").arg("-c").arg("echo \"research: $0\"")
    }

    fn app(state: &SharedState) -> Router {
        api_router().with_state(state.clone())
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(body: Body) -> String {
        let bytes = body.collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn start(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/start")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn wait_terminal(state: &SharedState, run_id: &str) {
        for _ in 0..250 {
            if state.registry.require(run_id).unwrap().status.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("run {} never finished", run_id);
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, echo_command());
        let response = app(&state).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response.into_body()).await, "ok");
    }

    #[tokio::test]
    async fn test_index_reports_not_running() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, echo_command());
        let response = app(&state).oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["running"], false);
    }

    #[tokio::test]
    async fn test_start_requires_content() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, echo_command());

        for body in ["", "{}", r#"{"research_content":"   "}"#, "not json"] {
            let response = app(&state).oneshot(start(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
            let json: serde_json::Value = body_json(response.into_body()).await;
            assert_eq!(json["status"], "missing_content");
            assert_eq!(json["detail"], "Research content is required");
        }
        assert!(state.registry.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_start_missing_executable() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let state = test_state(&dir, CommandSpec::new(&missing));

        let response = app(&state)
            .oneshot(start(r#"{"research_content":"topic"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["status"], "missing_executable");
        assert_eq!(json["detail"], missing.display().to_string());
    }

    #[tokio::test]
    async fn test_start_then_status_and_log() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, echo_command());

        let response = app(&state)
            .oneshot(start(r#"{"research_content":"  solar sails  "}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["status"], "started");
        let run_id = json["run_id"].as_str().unwrap().to_string();
        assert_eq!(run_id.len(), 32);
        let log = json["log"].as_str().unwrap();
        assert!(log.starts_with(&dir.path().join("logs").display().to_string()));
        assert!(log.ends_with(".log"));

        wait_terminal(&state, &run_id).await;

        let response = app(&state)
            .oneshot(get(&format!("/status?run_id={}", run_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let view: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(view["status"], "completed");
        assert_eq!(view["exit_code"], 0);
        assert_eq!(view["running"], false);
        assert_eq!(view["content_preview"], "solar sails");

        let response = app(&state)
            .oneshot(get(&format!("/log?run_id={}", run_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; charset=utf-8"
        );
        let text = body_text(response.into_body()).await;
        assert!(text.starts_with(&format!("Starting research run {}", run_id)));
        assert!(text.ends_with("research: solar sails\n"));

        let response = app(&state)
            .oneshot(get(&format!("/log?run_id={}&bytes=6", run_id)))
            .await
            .unwrap();
        assert_eq!(body_text(response.into_body()).await, "sails\n");
    }

    #[tokio::test]
    async fn test_status_unknown_run() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, echo_command());
        let response = app(&state)
            .oneshot(get("/status?run_id=missing"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["error"], "run_not_found");
    }

    #[tokio::test]
    async fn test_status_lists_all_runs() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, echo_command());
        state.registry.create("a", "/tmp/a.log").unwrap();
        state.registry.create("b", "/tmp/b.log").unwrap();

        let response = app(&state).oneshot(get("/status")).await.unwrap();
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["runs"]["a"]["status"], "queued");
        assert_eq!(json["runs"]["b"]["log"], "/tmp/b.log");
        assert!(json["runs"]["a"]["start"].is_null());
    }

    #[tokio::test]
    async fn test_log_requires_run_id() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, echo_command());
        let response = app(&state).oneshot(get("/log")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_log_unknown_run() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, echo_command());
        let response = app(&state).oneshot(get("/log?run_id=ghost")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_log_deleted_file_reports_status() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, echo_command());
        let log_path = dir.path().join("gone.log");
        state.registry.create("r1", &log_path).unwrap();
        state
            .registry
            .update("r1", RunUpdate::started(Utc::now()))
            .unwrap();
        state
            .registry
            .update("r1", RunUpdate::finished(1, Utc::now()))
            .unwrap();

        let response = app(&state).oneshot(get("/log?run_id=r1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_text(response.into_body()).await,
            format!(
                "Log file not found: {}\nRun status: {}",
                log_path.display(),
                RunStatus::Failed
            )
        );
    }

    #[tokio::test]
    async fn test_debug_info() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, echo_command());
        let response = app(&state).oneshot(get("/debug")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["executable"], "/bin/sh");
        assert_eq!(json["executable_exists"], true);
        assert_eq!(json["container"], "research-summaries");
        assert_eq!(json["active_runs"], 0);
        assert_eq!(json["agent_endpoint_set"], false);
    }

    #[tokio::test]
    async fn test_blobs_requires_run_folder() {
        let dir = TempDir::new().unwrap();
        let state = state_with_storage(&dir, stored_run().await);
        let response = app(&state).oneshot(get("/blobs")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["error"], "missing run_folder");
    }

    #[tokio::test]
    async fn test_blobs_without_storage_credentials() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, echo_command());
        assert!(state.storage.is_none());

        for uri in ["/blobs?run_folder=research_run_1", "/blob/download?name=a.md"] {
            let response = app(&state).oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR, "{uri}");
            let json: serde_json::Value = body_json(response.into_body()).await;
            assert_eq!(json["error"], "no_storage_credentials");
        }
    }

    #[tokio::test]
    async fn test_blobs_lists_only_the_run_folder() {
        let dir = TempDir::new().unwrap();
        let state = state_with_storage(&dir, stored_run().await);
        let response = app(&state)
            .oneshot(get("/blobs?run_folder=research_run_1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = body_json(response.into_body()).await;
        let blobs = json["blobs"].as_array().unwrap();
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0]["name"], "research_run_1/final_research_summary_b.md");
        assert_eq!(blobs[0]["size"], 13);
        assert!(blobs[0]["last_modified"].is_null());
        assert_eq!(blobs[1]["name"], "research_run_1/research_step_01_a.md");
    }

    #[tokio::test]
    async fn test_download_requires_name() {
        let dir = TempDir::new().unwrap();
        let state = state_with_storage(&dir, stored_run().await);
        let response = app(&state).oneshot(get("/blob/download")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["error"], "missing name");
    }

    #[tokio::test]
    async fn test_download_returns_markdown_attachment() {
        let dir = TempDir::new().unwrap();
        let state = state_with_storage(&dir, stored_run().await);
        let response = app(&state)
            .oneshot(get(
                "/blob/download?name=research_run_1/final_research_summary_b.md",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/markdown; charset=utf-8"
        );
        assert_eq!(
            response.headers()["content-disposition"],
            "attachment; filename=final_research_summary_b.md"
        );
        assert_eq!(body_text(response.into_body()).await, "# Final\nomega");
    }

    #[tokio::test]
    async fn test_download_unknown_document() {
        let dir = TempDir::new().unwrap();
        let state = state_with_storage(&dir, stored_run().await);
        let response = app(&state)
            .oneshot(get("/blob/download?name=research_run_1/missing.md"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["error"], "blob_not_found");
    }
}
