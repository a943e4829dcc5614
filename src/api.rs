use std::path::Path;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path as UrlPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::dispatcher::{DispatchError, Dispatcher, ExecutionReport, ExecutionRequest};
use crate::formatter::TerminalLine;
use crate::languages::LanguageTable;
use crate::templates;
use crate::terminal::{self, TerminalResponse};
use crate::workspace::{FileRecord, Workspace, WorkspaceError};

const SAVE_ROUTE_NAME: &str = "save";

#[derive(Clone)]
pub struct AppState {
    pub workspace: Workspace,
    pub dispatcher: Dispatcher,
    pub languages: Arc<LanguageTable>,
}

pub fn build_router(state: AppState, static_dir: Option<&Path>) -> Router {
    let api = Router::new()
        .route("/files", get(list_files))
        .route(
            "/files/save",
            post(save_file)
                .get(get_file_named_save)
                .delete(delete_file_named_save),
        )
        .route("/files/{name}", get(get_file).delete(delete_file))
        .route("/run", post(run_code))
        .route("/languages", get(list_languages))
        .route("/templates", get(list_templates))
        .route("/templates/{kind}", post(load_template))
        .route("/terminal", post(terminal_command))
        .fallback(api_not_found)
        .with_state(state);

    let mut router = Router::new()
        .route("/health", get(health))
        .nest("/api", api);

    if let Some(dir) = static_dir {
        info!("Serving front end from {}", dir.display());
        let index = ServeFile::new(dir.join("index.html"));
        router = router.fallback_service(ServeDir::new(dir).fallback(index));
    }

    with_cors(router).layer(TraceLayer::new_for_http())
}

pub fn with_cors(router: Router) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    router.layer(cors)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn api_not_found() -> ApiError {
    ApiError::NotFound("No such API route".to_string())
}

async fn list_files(State(state): State<AppState>) -> Result<Json<Vec<FileRecord>>, ApiError> {
    Ok(Json(state.workspace.list().await?))
}

async fn get_file(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Json<FileRecord>, ApiError> {
    Ok(Json(state.workspace.get(&name).await?))
}

// `/files/save` shadows `/files/{name}` for a file literally named "save"
async fn get_file_named_save(
    State(state): State<AppState>,
) -> Result<Json<FileRecord>, ApiError> {
    Ok(Json(state.workspace.get(SAVE_ROUTE_NAME).await?))
}

async fn delete_file_named_save(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.workspace.delete(SAVE_ROUTE_NAME).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct SaveFileRequest {
    name: String,
    content: String,
}

async fn save_file(
    State(state): State<AppState>,
    payload: Result<Json<SaveFileRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(request) = payload?;
    state.workspace.write(&request.name, &request.content).await?;
    Ok(Json(json!({ "success": true })))
}

async fn delete_file(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.workspace.delete(&name).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunResponse {
    output: String,
    error: Option<String>,
    lines: Vec<TerminalLine>,
    exit_code: Option<i32>,
    timed_out: bool,
    duration_ms: u64,
}

impl From<&ExecutionReport> for RunResponse {
    fn from(report: &ExecutionReport) -> Self {
        Self {
            output: report.output().to_string(),
            error: report.error(),
            lines: report.lines(),
            exit_code: report.exit_code(),
            timed_out: report.timed_out(),
            duration_ms: report.duration_ms(),
        }
    }
}

async fn run_code(
    State(state): State<AppState>,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Result<Json<RunResponse>, ApiError> {
    let Json(request) = payload?;
    // Dropping the handle (client disconnect) kills the run
    let report = state.dispatcher.submit(request).join().await?;
    Ok(Json(RunResponse::from(&report)))
}

async fn list_languages(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.languages.supported_languages())
}

#[derive(Debug, Serialize)]
struct TemplateInfo {
    name: &'static str,
    description: &'static str,
    files: Vec<&'static str>,
}

async fn list_templates() -> Json<Vec<TemplateInfo>> {
    Json(
        templates::TEMPLATES
            .iter()
            .map(|t| TemplateInfo {
                name: t.name,
                description: t.description,
                files: t.files.iter().map(|f| f.name).collect(),
            })
            .collect(),
    )
}

#[derive(Debug, Serialize)]
struct TemplateResponse {
    files: Vec<FileRecord>,
    lines: Vec<TerminalLine>,
}

async fn load_template(
    State(state): State<AppState>,
    UrlPath(kind): UrlPath<String>,
) -> Result<Json<TemplateResponse>, ApiError> {
    let template = templates::find(&kind)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown template: {}", kind)))?;
    let files = templates::instantiate(template, &state.workspace).await?;
    info!("Loaded template {}", template.name);

    Ok(Json(TemplateResponse {
        files,
        lines: vec![TerminalLine::success(format!(
            "Template {} loaded.",
            template.name.to_uppercase()
        ))],
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminalRequest {
    command: String,
    #[serde(default)]
    file_name: Option<String>,
}

async fn terminal_command(
    State(state): State<AppState>,
    payload: Result<Json<TerminalRequest>, JsonRejection>,
) -> Result<Json<TerminalResponse>, ApiError> {
    let Json(request) = payload?;
    let response = terminal::handle(
        &request.command,
        request.file_name.as_deref(),
        &state.workspace,
        &state.dispatcher,
    )
    .await;
    Ok(Json(response))
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<WorkspaceError> for ApiError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::NotFound(_) => ApiError::NotFound(err.to_string()),
            WorkspaceError::InvalidFileName { .. } => ApiError::BadRequest(err.to_string()),
            WorkspaceError::Storage { .. } => {
                error!("{}", err);
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Unsupported(_) => {
                warn!("{}", err);
                ApiError::BadRequest(err.to_string())
            }
            DispatchError::Workspace(err) => err.into(),
            _ => {
                error!("{}", err);
                ApiError::Internal(err.to_string())
            }
        }
    }
}
