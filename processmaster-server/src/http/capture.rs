//! `/capture` endpoints: sessions, screenshots, interactions, processing.

use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use processmaster_core::config::CaptureConfig;
use processmaster_core::ObjectStore;
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use super::extract::{JsonBody, PathParams};
use super::multipart::{MultipartForm, UploadedFile};
use super::{created, ok, AppState, Reply};
use crate::error::{ApiError, ApiResult};
use crate::subsystems::auth::AuthUser;
use crate::subsystems::capture::{
    self, CaptureResult, NewInteraction, ScreenshotUpload, StartSession,
};
use crate::subsystems::jobs::JobQueue;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/start", post(start_handler))
        .route("/stop", post(stop_handler))
        .route("/upload", post(upload_handler))
        .route("/:id/status", get(status_handler))
        .route("/:id/screenshot", post(screenshot_handler))
        .route("/:id/interaction", post(interaction_handler))
        .route("/:id/interactions", get(interactions_handler))
        .route("/:id/process", post(process_handler))
        .route("/:id/result", get(result_handler))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub session_id: Option<Uuid>,
}

/// RFC 3339 or epoch milliseconds.
pub fn parse_timestamp(raw: &str) -> ApiResult<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| ApiError::validation("Invalid timestamp"))
}

fn to_upload(file: UploadedFile) -> ScreenshotUpload {
    ScreenshotUpload {
        bytes: file.bytes,
        original_name: file.filename,
        ..ScreenshotUpload::default()
    }
}

/// Screenshot plus the metadata fields sent alongside it.
pub fn screenshot_from_form(form: &mut MultipartForm, file_field: &str) -> ApiResult<ScreenshotUpload> {
    let file = form
        .take_file(file_field)
        .ok_or_else(|| ApiError::validation("No screenshot provided"))?;

    Ok(ScreenshotUpload {
        sequence: form.parsed("sequenceNumber")?,
        page_url: form.field("url").map(str::to_string),
        page_title: form.field("title").map(str::to_string),
        captured_at: form.field("timestamp").map(parse_timestamp).transpose()?,
        ..to_upload(file)
    })
}

// ============================================================================
// Inner functions
// ============================================================================

pub async fn start_inner(pool: &PgPool, user: &AuthUser, req: StartSession) -> Reply {
    let session = capture::start_session(pool, user.id, req).await?;
    created(session)
}

pub async fn stop_inner(pool: &PgPool, user: &AuthUser, req: StopRequest) -> Reply {
    let session_id = req
        .session_id
        .ok_or_else(|| ApiError::validation("Session ID is required"))?;
    let session = capture::stop_session(pool, session_id, user.id).await?;
    ok(session)
}

pub async fn status_inner(pool: &PgPool, user: &AuthUser, session_id: Uuid) -> Reply {
    ok(capture::session_status(pool, session_id, user.id).await?)
}

pub async fn upload_inner(
    pool: &PgPool,
    store: &dyn ObjectStore,
    config: &CaptureConfig,
    user: &AuthUser,
    mut form: MultipartForm,
) -> Reply {
    let session_id: Uuid = form
        .parsed("sessionId")?
        .ok_or_else(|| ApiError::validation("Session ID is required"))?;
    let files = form
        .take_files("screenshots")
        .into_iter()
        .map(to_upload)
        .collect();

    let summary =
        capture::upload_screenshots(pool, store, config, session_id, user.id, files).await?;
    ok(summary)
}

pub async fn screenshot_inner(
    pool: &PgPool,
    store: &dyn ObjectStore,
    config: &CaptureConfig,
    user: &AuthUser,
    session_id: Uuid,
    mut form: MultipartForm,
) -> Reply {
    let upload = screenshot_from_form(&mut form, "screenshot")?;
    let row = capture::add_screenshot(pool, store, config, session_id, user.id, upload).await?;
    created(row)
}

pub async fn interaction_inner(
    pool: &PgPool,
    user: &AuthUser,
    session_id: Uuid,
    new: NewInteraction,
) -> Reply {
    let row = capture::record_interaction(pool, session_id, user.id, new).await?;
    created(row)
}

pub async fn interactions_inner(pool: &PgPool, user: &AuthUser, session_id: Uuid) -> Reply {
    ok(capture::list_interactions(pool, session_id, user.id).await?)
}

pub async fn process_inner(
    pool: &PgPool,
    jobs: &JobQueue,
    user: &AuthUser,
    session_id: Uuid,
) -> Reply {
    let job = capture::process_session(pool, jobs, session_id, user.id).await?;
    ok(serde_json::json!({
        "jobId": job.id,
        "status": "processing",
        "message": "AI processing started",
    }))
}

/// A failed job is reported with 200 and `success: false`.
pub fn render_result(result: CaptureResult) -> Reply {
    match result {
        CaptureResult::Completed {
            guide_id,
            guide,
            processing_time,
        } => ok(serde_json::json!({
            "status": "completed",
            "guideId": guide_id,
            "guide": guide,
            "processingTime": processing_time,
        })),
        CaptureResult::Failed(message) => Ok((
            StatusCode::OK,
            Json(serde_json::json!({
                "success": false,
                "error": {
                    "code": "PROCESSING_FAILED",
                    "message": message,
                },
            })),
        )),
        CaptureResult::InProgress(status) => ok(serde_json::json!({
            "status": status,
            "message": "Processing in progress...",
        })),
    }
}

pub async fn result_inner(
    pool: &PgPool,
    jobs: &JobQueue,
    user: &AuthUser,
    session_id: Uuid,
) -> Reply {
    render_result(capture::session_result(pool, jobs, session_id, user.id).await?)
}

// ============================================================================
// Axum handler wrappers
// ============================================================================

pub async fn start_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    JsonBody(req): JsonBody<StartSession>,
) -> Reply {
    start_inner(&state.pool, &user, req).await
}

pub async fn stop_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    JsonBody(req): JsonBody<StopRequest>,
) -> Reply {
    stop_inner(&state.pool, &user, req).await
}

pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams(id): PathParams<Uuid>,
) -> Reply {
    status_inner(&state.pool, &user, id).await
}

pub async fn upload_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    multipart: Multipart,
) -> Reply {
    let form = MultipartForm::read(multipart).await?;
    upload_inner(&state.pool, state.store.as_ref(), &state.config.capture, &user, form).await
}

pub async fn screenshot_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams(id): PathParams<Uuid>,
    multipart: Multipart,
) -> Reply {
    let form = MultipartForm::read(multipart).await?;
    screenshot_inner(
        &state.pool,
        state.store.as_ref(),
        &state.config.capture,
        &user,
        id,
        form,
    )
    .await
}

pub async fn interaction_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams(id): PathParams<Uuid>,
    JsonBody(new): JsonBody<NewInteraction>,
) -> Reply {
    interaction_inner(&state.pool, &user, id, new).await
}

pub async fn interactions_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams(id): PathParams<Uuid>,
) -> Reply {
    interactions_inner(&state.pool, &user, id).await
}

pub async fn process_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams(id): PathParams<Uuid>,
) -> Reply {
    process_inner(&state.pool, &state.jobs, &user, id).await
}

pub async fn result_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams(id): PathParams<Uuid>,
) -> Reply {
    result_inner(&state.pool, &state.jobs, &user, id).await
}
