//! `/upload` endpoints. `/upload/objects/*key` is authorized by the URL
//! signature alone; everything else needs a bearer token.

use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use bytes::Bytes;
use processmaster_core::config::CaptureConfig;
use processmaster_core::ObjectStore;
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use super::extract::{JsonBody, PathParams, QueryParams};
use super::multipart::MultipartForm;
use super::{created, ok, AppState, Reply};
use crate::error::{ApiError, ApiResult};
use crate::subsystems::auth::AuthUser;
use crate::subsystems::capture::{self, ScreenshotUpload};
use crate::subsystems::uploads::{self, ConfirmUpload, ListFiles, PresignRequest};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/presigned-url", post(presign_handler))
        .route("/screenshot", post(screenshot_handler))
        .route("/confirm", post(confirm_handler))
        .route("/files", get(files_handler))
        .route("/download/*key", get(download_handler))
        .route(
            "/objects/*key",
            get(get_object_handler).put(put_object_handler),
        )
        .route("/:prefix/*rest", delete(delete_handler))
}

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub signature: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuery {
    pub expiration_time: Option<u64>,
}

/// Wildcard captures may carry a leading slash.
pub fn wildcard_key(raw: &str) -> String {
    raw.trim_start_matches('/').to_string()
}

// ============================================================================
// Inner functions
// ============================================================================

pub fn presign_inner(store: &dyn ObjectStore, user: &AuthUser, req: &PresignRequest) -> Reply {
    ok(uploads::presign_upload(store, user.id, req)?)
}

/// Same ingestion as `/capture/:id/screenshot`, with the session in the form.
pub async fn screenshot_inner(
    pool: &PgPool,
    store: &dyn ObjectStore,
    config: &CaptureConfig,
    user: &AuthUser,
    mut form: MultipartForm,
) -> Reply {
    let session_id: Uuid = form
        .parsed("captureSessionId")?
        .ok_or_else(|| ApiError::validation("Capture session ID is required"))?;
    let file = form
        .take_file("screenshot")
        .ok_or_else(|| ApiError::validation("No file provided"))?;

    let upload = ScreenshotUpload {
        bytes: file.bytes,
        original_name: file.filename,
        sequence: form.parsed("stepNumber")?,
        page_url: form.field("pageUrl").map(str::to_string),
        page_title: form.field("pageTitle").map(str::to_string),
        captured_at: None,
    };
    let row = capture::add_screenshot(pool, store, config, session_id, user.id, upload).await?;
    created(row)
}

pub async fn confirm_inner(
    pool: &PgPool,
    store: &dyn ObjectStore,
    user: &AuthUser,
    req: ConfirmUpload,
) -> Reply {
    ok(uploads::confirm_upload(pool, store, user, req).await?)
}

pub async fn download_inner(
    pool: &PgPool,
    store: &dyn ObjectStore,
    user: &AuthUser,
    key: &str,
    query: DownloadQuery,
) -> Reply {
    let signed = uploads::download_url(pool, store, user, key, query.expiration_time).await?;
    ok(serde_json::json!({
        "downloadUrl": signed.url,
        "expiresIn": signed.expires_in,
        "expiresAt": signed.expires_at,
    }))
}

pub async fn delete_inner(pool: &PgPool, store: &dyn ObjectStore, user: &AuthUser, key: &str) -> Reply {
    uploads::delete_file(pool, store, user, key).await?;
    ok(serde_json::json!({ "message": "File deleted successfully" }))
}

pub async fn files_inner(pool: &PgPool, user: &AuthUser, query: &ListFiles) -> Reply {
    ok(uploads::list_files(pool, user.id, query).await?)
}

pub async fn put_object_inner(
    store: &dyn ObjectStore,
    key: &str,
    query: &SignedQuery,
    body: &[u8],
    max_bytes: usize,
) -> Reply {
    let meta =
        uploads::put_signed_object(store, key, query.expires, &query.signature, body, max_bytes)
            .await?;
    ok(meta)
}

pub async fn get_object_inner(
    store: &dyn ObjectStore,
    key: &str,
    query: &SignedQuery,
) -> ApiResult<Response> {
    let (bytes, content_type) =
        uploads::get_signed_object(store, key, query.expires, &query.signature).await?;
    Ok((StatusCode::OK, [(CONTENT_TYPE, content_type)], bytes).into_response())
}

// ============================================================================
// Axum handler wrappers
// ============================================================================

pub async fn presign_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    JsonBody(req): JsonBody<PresignRequest>,
) -> Reply {
    presign_inner(state.store.as_ref(), &user, &req)
}

pub async fn screenshot_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    multipart: Multipart,
) -> Reply {
    let form = MultipartForm::read(multipart).await?;
    screenshot_inner(&state.pool, state.store.as_ref(), &state.config.capture, &user, form).await
}

pub async fn confirm_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    JsonBody(req): JsonBody<ConfirmUpload>,
) -> Reply {
    confirm_inner(&state.pool, state.store.as_ref(), &user, req).await
}

pub async fn download_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams(key): PathParams<String>,
    QueryParams(query): QueryParams<DownloadQuery>,
) -> Reply {
    download_inner(&state.pool, state.store.as_ref(), &user, &wildcard_key(&key), query).await
}

pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams((prefix, rest)): PathParams<(String, String)>,
) -> Reply {
    let key = format!("{}/{}", prefix, wildcard_key(&rest));
    delete_inner(&state.pool, state.store.as_ref(), &user, &key).await
}

pub async fn files_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    QueryParams(query): QueryParams<ListFiles>,
) -> Reply {
    files_inner(&state.pool, &user, &query).await
}

pub async fn put_object_handler(
    State(state): State<Arc<AppState>>,
    PathParams(key): PathParams<String>,
    QueryParams(query): QueryParams<SignedQuery>,
    body: Bytes,
) -> Reply {
    put_object_inner(
        state.store.as_ref(),
        &wildcard_key(&key),
        &query,
        &body,
        state.config.storage.max_upload_bytes,
    )
    .await
}

pub async fn get_object_handler(
    State(state): State<Arc<AppState>>,
    PathParams(key): PathParams<String>,
    QueryParams(query): QueryParams<SignedQuery>,
) -> Response {
    match get_object_inner(state.store.as_ref(), &wildcard_key(&key), &query).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}
