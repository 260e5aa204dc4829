use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::daemon::dispatcher::TaskHandle;
use crate::daemon::resources::{UsageLevel, UsageReport};
use crate::errors::{PipelineError, ValidationError};
use crate::models::{JobId, Stage, StageParams, TaskRecord};
use crate::validation::{
    accept_upload, check_declared_size, validate_file_name, validate_upload, AcceptedUpload,
};

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

fn error_response(status: StatusCode, error: &str, message: String) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message,
        }),
    )
        .into_response()
}

fn validation_status(err: &ValidationError) -> StatusCode {
    match err {
        ValidationError::FileTooLarge { .. } | ValidationError::ArchiveTooLarge { .. } => {
            StatusCode::PAYLOAD_TOO_LARGE
        }
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Map an error to its status code and reason code. Typed errors are
/// recovered from the anyhow chain; anything else is a 500.
pub fn failure(err: anyhow::Error) -> Response {
    if let Some(v) = err.downcast_ref::<ValidationError>() {
        tracing::warn!("Upload rejected: {}", v);
        return error_response(validation_status(v), v.code(), v.to_string());
    }
    let Some(pipeline) = err.downcast_ref::<PipelineError>() else {
        tracing::error!("Request failed: {:#}", err);
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            format!("{:#}", err),
        );
    };
    match pipeline {
        PipelineError::Validation(v) => {
            tracing::warn!("Upload rejected: {}", v);
            error_response(validation_status(v), v.code(), v.to_string())
        }
        PipelineError::NotFound(m) => error_response(StatusCode::NOT_FOUND, "not_found", m.clone()),
        PipelineError::Conflict(m) => {
            tracing::warn!("Submission rejected: {}", m);
            error_response(StatusCode::CONFLICT, "conflict", m.clone())
        }
        PipelineError::InvalidRequest(m) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", m.clone())
        }
        PipelineError::Resource(m) => {
            tracing::warn!("Resource limit hit: {}", m);
            error_response(StatusCode::INSUFFICIENT_STORAGE, "insufficient_storage", m.clone())
        }
        PipelineError::Storage(_) | PipelineError::Internal(_) => {
            tracing::error!("Request failed: {:#}", err);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                pipeline.to_string(),
            )
        }
    }
}

fn respond<T: Serialize>(status: StatusCode, result: anyhow::Result<T>) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(e) => failure(e),
    }
}

fn parse_target(job_id: &str, stage: &str) -> anyhow::Result<(JobId, Stage)> {
    Ok((JobId::parse(job_id)?, stage.parse::<Stage>()?))
}

// ---------------------------------------------------------------------------
// Query params and bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OldestParams {
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    10
}

#[derive(Debug, Deserialize, Default)]
pub struct CleanupParams {
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
pub struct JobCreated {
    pub job_id: JobId,
}

#[derive(Debug, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub stages: Vec<TaskRecord>,
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub level: UsageLevel,
    #[serde(flatten)]
    pub report: UsageReport,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// POST /api/jobs
pub async fn create_job(State(state): State<Arc<AppState>>) -> Response {
    let result = state
        .dispatcher
        .create_job()
        .await
        .map(|job_id| JobCreated { job_id });
    respond(StatusCode::CREATED, result)
}

/// GET /api/jobs/{job_id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    respond(StatusCode::OK, job_status(&state, &job_id).await)
}

async fn job_status(state: &AppState, job_id: &str) -> anyhow::Result<JobStatus> {
    let job_id = JobId::parse(job_id)?;
    let stages = state.dispatcher.job_status(&job_id).await?;
    Ok(JobStatus { job_id, stages })
}

/// POST /api/jobs/{job_id}/uploads/{file_name}
pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    Path((job_id, file_name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    respond(
        StatusCode::CREATED,
        receive_upload(&state, &job_id, &file_name, &headers, body).await,
    )
}

async fn receive_upload(
    state: &AppState,
    job_id: &str,
    file_name: &str,
    headers: &HeaderMap,
    body: Body,
) -> anyhow::Result<AcceptedUpload> {
    let job_id = JobId::parse(job_id)?;
    if !state.dispatcher.job_exists(&job_id).await {
        return Err(PipelineError::NotFound(format!("Job '{}' does not exist", job_id)).into());
    }

    let name = validate_file_name(file_name, &state.policy)?;
    let limit = state.policy.limit_for(&name);
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if let Some(size) = declared {
        check_declared_size(&name, size, &state.policy)?;
    }

    let bytes = read_limited(&name, body, limit).await?;
    let upload = validate_upload(&name, bytes, &state.policy)?;
    state.resources.ensure_capacity(upload.disk_bytes()).await?;
    accept_upload(&state.layout, &job_id, upload).await
}

/// Read at most `limit` bytes of body. Anything longer is rejected as too
/// large without being buffered.
async fn read_limited(name: &str, body: Body, limit: u64) -> anyhow::Result<Bytes> {
    let max = usize::try_from(limit).unwrap_or(usize::MAX);
    match axum::body::to_bytes(body, max).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if exceeds_limit(&e) => Err(ValidationError::FileTooLarge {
            name: name.to_string(),
            size: limit.saturating_add(1),
            limit,
        }
        .into()),
        Err(e) => Err(PipelineError::InvalidRequest(format!("Failed to read upload: {}", e)).into()),
    }
}

fn exceeds_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// POST /api/jobs/{job_id}/stages/{stage}
///
/// Body is the stage's parameter object; an empty body means defaults.
pub async fn submit_stage(
    State(state): State<Arc<AppState>>,
    Path((job_id, stage)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    respond(
        StatusCode::ACCEPTED,
        submit(&state, &job_id, &stage, &body).await,
    )
}

async fn submit(
    state: &AppState,
    job_id: &str,
    stage: &str,
    body: &[u8],
) -> anyhow::Result<TaskHandle> {
    let (job_id, stage) = parse_target(job_id, stage)?;
    let value = if body.iter().all(u8::is_ascii_whitespace) {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(body)
            .map_err(|e| PipelineError::InvalidRequest(format!("Invalid JSON body: {}", e)))?
    };
    let params = StageParams::from_json(stage, value)?;
    state.dispatcher.submit(&job_id, params).await
}

/// GET /api/jobs/{job_id}/stages/{stage}
pub async fn get_stage(
    State(state): State<Arc<AppState>>,
    Path((job_id, stage)): Path<(String, String)>,
) -> Response {
    let result = match parse_target(&job_id, &stage) {
        Ok((job_id, stage)) => state.dispatcher.status(&job_id, stage).await,
        Err(e) => Err(e),
    };
    respond(StatusCode::OK, result)
}

/// POST /api/jobs/{job_id}/stages/{stage}/abandon
pub async fn abandon_stage(
    State(state): State<Arc<AppState>>,
    Path((job_id, stage)): Path<(String, String)>,
) -> Response {
    let result = match parse_target(&job_id, &stage) {
        Ok((job_id, stage)) => state.dispatcher.abandon(&job_id, stage).await,
        Err(e) => Err(e),
    };
    respond(StatusCode::OK, result)
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// GET /api/resources/usage
pub async fn usage(State(state): State<Arc<AppState>>) -> Response {
    let result = state.resources.usage_report().await.map(|report| UsageResponse {
        level: state.resources.classify(report.usage_pct),
        report,
    });
    respond(StatusCode::OK, result)
}

/// GET /api/resources/oldest?count=N
pub async fn oldest_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<OldestParams>,
) -> Response {
    respond(StatusCode::OK, state.resources.oldest_jobs(params.count).await)
}

/// POST /api/resources/cleanup?dry_run=bool
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CleanupParams>,
) -> Response {
    respond(
        StatusCode::OK,
        state.resources.cleanup_old_jobs(params.dry_run).await,
    )
}
