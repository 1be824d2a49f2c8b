// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP gateway for one deployed workflow endpoint.
//!
//! Routes (all JSON, UTF-8):
//!
//! | Method | Path                | Auth    |
//! |--------|---------------------|---------|
//! | GET    | /healthz            | public  |
//! | GET    | /contract           | api key |
//! | POST   | /files              | api key |
//! | GET    | /files              | api key |
//! | GET    | /files/{id}         | api key |
//! | GET    | /files/{id}/download| api key |
//! | POST   | /run                | api key |
//! | GET    | /jobs/{id}          | api key |
//! | POST   | /jobs/{id}/cancel   | api key |
//!
//! Request handlers return quickly; job execution runs on spawned tasks so
//! long-running executors never block request I/O.

#![deny(unsafe_code)]

mod auth;

pub use auth::constant_time_eq;

use axum::{
    body::Bytes,
    extract::{Path as AxPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ce_core::{FileRecord, FileSource, JobRecord, WorkflowContract};
use ce_executor::JobExecutor;
use ce_store::{FileFilters, FileStore, JobStore};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

/// Upper bound for uploaded request bodies (media inputs can be large).
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

// ---------------------------------------------------------------------------
// State & errors
// ---------------------------------------------------------------------------

/// Shared state behind every handler.
pub struct AppState {
    pub contract: Arc<WorkflowContract>,
    pub files: Arc<FileStore>,
    pub jobs: Arc<JobStore>,
    pub executor: Arc<JobExecutor>,
    pub api_key: String,
}

/// Error body: `{error: <kind>, detail?: <string>}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: String,
    pub detail: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn validation(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR").with_detail(detail)
    }

    fn not_found(error: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error)
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error").with_detail(detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = Map::new();
        body.insert("error".into(), Value::String(self.error));
        if let Some(detail) = self.detail {
            body.insert("detail".into(), Value::String(detail));
        }
        (self.status, Json(Value::Object(body))).into_response()
    }
}

impl From<ce_store::StoreError> for ApiError {
    fn from(err: ce_store::StoreError) -> Self {
        match err {
            ce_store::StoreError::InvalidArgument(detail) => {
                ApiError::new(StatusCode::BAD_REQUEST, detail)
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the gateway router with all routes and the API-key middleware.
pub fn build_app(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/contract", get(cmd_contract))
        .route("/files", post(cmd_upload_file).get(cmd_list_files))
        .route("/files/{id}", get(cmd_get_file))
        .route("/files/{id}/download", get(cmd_download_file))
        .route("/run", post(cmd_run))
        .route("/jobs/{id}", get(cmd_get_job))
        .route("/jobs/{id}/cancel", post(cmd_cancel_job))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        .layer(axum::extract::DefaultBodyLimit::max(MAX_UPLOAD_BYTES));

    Router::new()
        .route("/healthz", get(cmd_healthz))
        .merge(protected)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn cmd_healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn cmd_contract(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::to_value(state.contract.as_ref()).unwrap_or(Value::Null))
}

/// `POST /files` — body is the raw blob; metadata rides in headers.
async fn cmd_upload_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if body.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "empty_file"));
    }
    let media_type = header_str(&headers, header::CONTENT_TYPE.as_str())
        .unwrap_or("application/octet-stream")
        .to_string();
    let original_name = header_str(&headers, "x-file-name").unwrap_or("").to_string();
    let app_id = header_str(&headers, "x-app-id")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let record = state.files.create_file(
        &body,
        &media_type,
        FileSource::Uploaded,
        app_id.as_deref(),
        &original_name,
    )?;
    info!(file_id = %record.file_id, size = record.size_bytes, "file uploaded");
    Ok((StatusCode::CREATED, Json(file_payload(&record))).into_response())
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<String>,
    cursor: Option<String>,
    media_type: Option<String>,
    source: Option<String>,
    app_id: Option<String>,
}

async fn cmd_list_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit: usize = match query.limit {
        Some(raw) => raw
            .parse()
            .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid_limit"))?,
        None => 50,
    };
    let cursor: Option<i64> = match query.cursor {
        Some(raw) => Some(
            raw.parse()
                .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid_cursor"))?,
        ),
        None => None,
    };

    // An unknown source tag is a filter that matches nothing, not an error.
    let source = match query.source.as_deref() {
        Some(raw) => match FileSource::parse(raw) {
            Some(source) => Some(source),
            None => {
                return Ok(Json(json!({"items": [], "next_cursor": null})));
            }
        },
        None => None,
    };

    let filters = FileFilters {
        media_type: query.media_type,
        source,
        app_id: query.app_id,
    };
    let page = state.files.list_files(limit, cursor, &filters)?;
    let items: Vec<Value> = page.records.iter().map(file_payload).collect();
    Ok(Json(json!({
        "items": items,
        "next_cursor": page.next_cursor,
    })))
}

async fn cmd_get_file(
    State(state): State<Arc<AppState>>,
    AxPath(file_id): AxPath<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .files
        .get_file(&file_id)?
        .ok_or_else(|| ApiError::not_found("file_not_found"))?;
    Ok(Json(file_payload(&record)))
}

async fn cmd_download_file(
    State(state): State<Arc<AppState>>,
    AxPath(file_id): AxPath<String>,
) -> Result<Response, ApiError> {
    let record = state
        .files
        .get_file(&file_id)?
        .filter(|record| record.storage_path.exists())
        .ok_or_else(|| ApiError::not_found("file_not_found"))?;

    let content =
        std::fs::read(&record.storage_path).map_err(|e| ApiError::internal(e.to_string()))?;
    let filename = if record.original_name.is_empty() {
        record
            .storage_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&record.file_id)
            .to_string()
    } else {
        record.original_name.clone()
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, record.media_type.clone()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        content,
    )
        .into_response())
}

/// `POST /run` — validate, persist, schedule, answer 202.
async fn cmd_run(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let payload: Value =
        serde_json::from_slice(&body).map_err(|_| ApiError::validation("invalid_json"))?;
    let Some(object) = payload.as_object() else {
        return Err(ApiError::validation("payload_not_object"));
    };

    validate_run_payload(&state.contract, object)?;

    let job = state.jobs.create(&payload)?;
    info!(job_id = %job.job_id, "job accepted");

    let executor = state.executor.clone();
    let job_id = job.job_id.clone();
    tokio::spawn(async move {
        executor.execute(&job_id, payload).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"job_id": job.job_id, "state": "queued"})),
    )
        .into_response())
}

async fn cmd_get_job(
    State(state): State<Arc<AppState>>,
    AxPath(job_id): AxPath<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .jobs
        .get(&job_id)?
        .ok_or_else(|| ApiError::not_found("job_not_found"))?;
    Ok(Json(job_payload(&record)))
}

async fn cmd_cancel_job(
    State(state): State<Arc<AppState>>,
    AxPath(job_id): AxPath<String>,
) -> Result<Response, ApiError> {
    let record = state
        .jobs
        .request_cancel(&job_id)?
        .ok_or_else(|| ApiError::not_found("job_not_found"))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": record.job_id,
            "state": record.state,
            "cancel_requested": record.cancel_requested,
        })),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Validation & payload shaping
// ---------------------------------------------------------------------------

/// Keys must be exactly the required inputs, optionally extended by
/// optional inputs; anything else is rejected.
fn validate_run_payload(
    contract: &WorkflowContract,
    payload: &Map<String, Value>,
) -> Result<(), ApiError> {
    for field in &contract.inputs {
        if field.required && !payload.contains_key(&field.name) {
            return Err(ApiError::validation(format!(
                "missing_required_input:{}",
                field.name
            )));
        }
    }

    let mut unexpected: Vec<&str> = payload
        .keys()
        .filter(|key| contract.input(key).is_none())
        .map(String::as_str)
        .collect();
    if !unexpected.is_empty() {
        unexpected.sort_unstable();
        return Err(ApiError::validation(format!(
            "unexpected_inputs:{}",
            unexpected.join(",")
        )));
    }

    Ok(())
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// File metadata payload; the storage path stays server-side, a download
/// path is added for convenience.
fn file_payload(record: &FileRecord) -> Value {
    let mut value = serde_json::to_value(record).unwrap_or(Value::Null);
    if let Some(object) = value.as_object_mut() {
        object.insert(
            "download_path".into(),
            Value::String(format!("/files/{}/download", record.file_id)),
        );
    }
    value
}

fn job_payload(record: &JobRecord) -> Value {
    json!({
        "job_id": record.job_id,
        "state": record.state,
        "output": record.output_payload,
        "error": record.error,
        "cancel_requested": record.cancel_requested,
    })
}
