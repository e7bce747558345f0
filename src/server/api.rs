use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::config::AuthSection;
use crate::db::DbHandle;
use crate::errors::JobError;
use crate::generate::best_practices::BestPracticeAdvisor;
use crate::generate::diff::{DEFAULT_CONTEXT_LINES, diff_file_sets, unified_diff};
use crate::generate::models::{GenerationRequest, Scenario};
use crate::generate::validator::Validator;
use crate::jobs::{JobManager, JobStatus};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub jobs: JobManager,
    pub db: DbHandle,
    pub auth: AuthSection,
    /// Used by `POST /jobs/cleanup` when the body names no age
    pub cleanup_max_age: Duration,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct CleanupRequest {
    pub max_age_secs: Option<u64>,
}

#[derive(Deserialize)]
pub struct ClarifyRequest {
    pub answer: String,
}

#[derive(Deserialize)]
pub struct ValidateRequest {
    #[serde(default)]
    pub files: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    /// Picks strict or lenient reference checks; strict when absent
    #[serde(default)]
    pub scenario: Option<Scenario>,
}

#[derive(Deserialize)]
pub struct DiffRequest {
    #[serde(default)]
    pub original: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub context_lines: Option<usize>,
    #[serde(default)]
    pub original_files: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub modified_files: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
pub struct BestPracticesRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub files: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub resource_type: Option<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub default_provider: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            JobError::NotFinished { .. } | JobError::InvalidTransition { .. } => {
                ApiError::Conflict(err.to_string())
            }
            JobError::Store(e) => ApiError::Internal(format!("{:#}", e)),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

/// Routes that require a bearer token when authentication is configured.
pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/v1/generate", post(generate))
        .route("/api/v1/jobs", get(list_jobs))
        .route("/api/v1/jobs/cleanup", post(cleanup_jobs))
        .route("/api/v1/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/api/v1/jobs/{id}/result", get(get_job_result))
        .route("/api/v1/jobs/{id}/clarify", post(clarify_job))
        .route("/api/v1/validate", post(validate))
        .route("/api/v1/diff", post(diff))
        .route("/api/v1/best-practices", post(best_practices))
        .route("/api/v1/projects", get(list_projects))
        .route("/api/v1/projects/{id}", get(get_project))
        .route("/api/v1/projects/{id}/files", get(list_project_files))
        .route("/api/v1/metrics", get(metrics))
}

/// Routes that are always open.
pub fn public_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Decode a JSON body, reporting malformed input as `{"error": ...}`.
fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid job id '{}'", raw)))
}

fn parse_project_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid project id '{}'", raw)))
}

/// Either an explicit file map or a single `code` string under `filename`.
fn files_from(
    files: Option<BTreeMap<String, String>>,
    code: Option<String>,
    filename: Option<String>,
) -> Option<BTreeMap<String, String>> {
    match (files, code) {
        (Some(files), _) if !files.is_empty() => Some(files),
        (_, Some(code)) => Some(BTreeMap::from([(
            filename.unwrap_or_else(|| "main.tf".to_string()),
            code,
        )])),
        _ => None,
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        default_provider: state.jobs.pipeline().providers().default_name().to_string(),
    })
}

async fn generate(State(state): State<SharedState>, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let request: GenerationRequest = parse_body(&body)?;
    request.check().map_err(ApiError::BadRequest)?;
    if let Some(name) = request.provider.as_deref() {
        state
            .jobs
            .pipeline()
            .providers()
            .get(Some(name))
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    }
    let job_id = state.jobs.submit(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": job_id, "status": JobStatus::Pending })),
    ))
}

async fn list_jobs(
    State(state): State<SharedState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let jobs = state.jobs.list(status).await?;
    Ok(Json(jobs))
}

async fn cleanup_jobs(State(state): State<SharedState>, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let request: CleanupRequest = if body.is_empty() {
        CleanupRequest::default()
    } else {
        parse_body(&body)?
    };
    let max_age = request
        .max_age_secs
        .map(Duration::from_secs)
        .unwrap_or(state.cleanup_max_age);
    let removed = state.jobs.cleanup(max_age).await?;
    Ok(Json(json!({ "removed": removed, "max_age_secs": max_age.as_secs() })))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(state.jobs.get_status(job_id).await?))
}

async fn get_job_result(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    let job = state.jobs.get_result(job_id).await?;
    Ok(Json(json!({
        "job_id": job.job_id,
        "status": job.status,
        "error_message": job.error_message,
        "result": job.result,
    })))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    let cancelled = state.jobs.cancel(job_id).await?;
    let status = state.jobs.get_status(job_id).await?.status;
    Ok(Json(json!({ "cancelled": cancelled, "status": status })))
}

async fn clarify_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    let request: ClarifyRequest = parse_body(&body)?;
    if request.answer.trim().is_empty() {
        return Err(ApiError::BadRequest("answer must not be empty".to_string()));
    }
    if !state.jobs.answer_clarification(job_id, request.answer).await? {
        return Err(ApiError::Conflict(format!(
            "Job {} is not waiting for clarification",
            job_id
        )));
    }
    Ok(Json(json!({ "delivered": true })))
}

async fn validate(body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let request: ValidateRequest = parse_body(&body)?;
    let files = files_from(request.files, request.code, request.filename)
        .ok_or_else(|| ApiError::BadRequest("Provide `files` or `code`".to_string()))?;
    let validator = request
        .scenario
        .map(Validator::for_scenario)
        .unwrap_or_default();
    Ok(Json(validator.validate(&files)))
}

async fn diff(body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let request: DiffRequest = parse_body(&body)?;
    if request.original_files.is_some() || request.modified_files.is_some() {
        let before = request.original_files.unwrap_or_default();
        let after = request.modified_files.unwrap_or_default();
        return Ok(Json(json!({ "files": diff_file_sets(&before, &after) })));
    }
    let (Some(original), Some(modified)) = (request.original, request.modified) else {
        return Err(ApiError::BadRequest(
            "Provide `original` and `modified`, or `original_files` and `modified_files`".to_string(),
        ));
    };
    let name = request.filename.unwrap_or_else(|| "main.tf".to_string());
    let diff = unified_diff(
        &original,
        &modified,
        &format!("a/{}", name),
        &format!("b/{}", name),
        request.context_lines.unwrap_or(DEFAULT_CONTEXT_LINES),
    );
    Ok(Json(json!(diff)))
}

async fn best_practices(body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let request: BestPracticesRequest = parse_body(&body)?;
    let advisor = BestPracticeAdvisor::new();
    if let Some(files) = files_from(request.files, request.code, None) {
        return Ok(Json(json!(advisor.review(&files))));
    }
    match request.resource_type.as_deref().map(str::trim) {
        Some(rtype) if !rtype.is_empty() => Ok(Json(json!({
            "resource_type": rtype,
            "recommendations": advisor.advise(rtype),
        }))),
        _ => Err(ApiError::BadRequest(
            "Provide `code`, `files` or `resource_type`".to_string(),
        )),
    }
}

async fn list_projects(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let projects = state
        .db
        .call(|db| db.list_projects())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(projects))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_project_id(&id)?;
    let project = state
        .db
        .call(move |db| db.get_project(id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    match project {
        Some(project) => Ok(Json(project)),
        None => Err(ApiError::NotFound(format!("Project {} not found", id))),
    }
}

async fn list_project_files(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_project_id(&id)?;
    let files = state
        .db
        .call(move |db| match db.get_project(id)? {
            Some(_) => Ok(Some(db.list_files_for_project(id)?)),
            None => Ok(None),
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    files
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Project {} not found", id)))
}

async fn metrics(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let running = state.jobs.list(Some(JobStatus::Running)).await?.len();
    let pending = state.jobs.list(Some(JobStatus::Pending)).await?.len();
    Ok(Json(json!({
        "jobs_running": running,
        "jobs_pending": pending,
        "totals": state.jobs.metrics(),
    })))
}
