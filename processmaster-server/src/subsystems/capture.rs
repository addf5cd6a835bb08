//! Capture sessions: lifecycle, screenshot and interaction ingestion.
//!
//! Sequence numbers come from per-session counters on `capture_sessions`,
//! advanced by an `UPDATE ... RETURNING` in the same transaction as the
//! insert. The row lock serializes concurrent writers to one session.

use chrono::{DateTime, Utc};
use processmaster_core::config::CaptureConfig;
use processmaster_core::imaging::{normalize_screenshot, NormalizedImage};
use processmaster_core::models::guide::GUIDE_COLUMNS;
use processmaster_core::models::interaction::INTERACTION_COLUMNS;
use processmaster_core::models::screenshot::SCREENSHOT_COLUMNS;
use processmaster_core::models::session::SESSION_COLUMNS;
use processmaster_core::models::{
    CaptureSession, Guide, Interaction, Job, JobStatus, JobType, Screenshot,
};
use processmaster_core::ObjectStore;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::jobs::{JobQueue, NewJob};
use crate::error::{ApiError, ApiResult};

/// Longest `inputValue` kept before truncation.
pub const MAX_INPUT_VALUE_CHARS: usize = 100;

pub const REDACTED: &str = "[REDACTED]";

/// Input types whose values are never stored.
const SENSITIVE_INPUT_TYPES: &[&str] = &["password", "credit-card", "social-security"];

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSession {
    pub title: Option<String>,
    pub description: Option<String>,
    pub browser_info: Option<serde_json::Value>,
}

pub async fn start_session(
    pool: &PgPool,
    owner: Uuid,
    req: StartSession,
) -> ApiResult<CaptureSession> {
    let now = Utc::now();
    let title = req
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| format!("Capture session {}", now.to_rfc3339()));
    let browser_info = req.browser_info.unwrap_or_else(|| serde_json::json!({}));
    let resolution = browser_info
        .get("viewport")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    let session = sqlx::query_as::<_, CaptureSession>(&format!(
        r#"
        INSERT INTO capture_sessions (user_id, title, description, status, browser_info, screen_resolution)
        VALUES ($1, $2, $3, 'active', $4, $5)
        RETURNING {SESSION_COLUMNS}
        "#
    ))
    .bind(owner)
    .bind(title)
    .bind(req.description)
    .bind(&browser_info)
    .bind(&resolution)
    .fetch_one(pool)
    .await?;

    tracing::info!(session_id = %session.id, user_id = %owner, "Capture session started");
    Ok(session)
}

/// The session if it exists and belongs to `owner`; 404 otherwise.
pub async fn owned_session(pool: &PgPool, session_id: Uuid, owner: Uuid) -> ApiResult<CaptureSession> {
    sqlx::query_as::<_, CaptureSession>(&format!(
        "SELECT {SESSION_COLUMNS} FROM capture_sessions WHERE id = $1 AND user_id = $2"
    ))
    .bind(session_id)
    .bind(owner)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("Capture session not found"))
}

/// Stopping twice re-stamps `stopped_at`.
pub async fn stop_session(pool: &PgPool, session_id: Uuid, owner: Uuid) -> ApiResult<CaptureSession> {
    let session = sqlx::query_as::<_, CaptureSession>(&format!(
        r#"
        UPDATE capture_sessions SET status = 'stopped', stopped_at = NOW()
        WHERE id = $1 AND user_id = $2
        RETURNING {SESSION_COLUMNS}
        "#
    ))
    .bind(session_id)
    .bind(owner)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("Capture session not found"))?;

    tracing::info!(session_id = %session_id, "Capture session stopped");
    Ok(session)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusView {
    pub session: CaptureSession,
    pub screenshot_count: i64,
    pub interaction_count: i64,
}

pub async fn session_status(
    pool: &PgPool,
    session_id: Uuid,
    owner: Uuid,
) -> ApiResult<SessionStatusView> {
    let session = owned_session(pool, session_id, owner).await?;

    let (screenshot_count, interaction_count): (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM screenshots WHERE capture_session_id = $1),
            (SELECT COUNT(*) FROM user_interactions WHERE capture_session_id = $1)
        "#,
    )
    .bind(session_id)
    .fetch_one(pool)
    .await?;

    Ok(SessionStatusView {
        session,
        screenshot_count,
        interaction_count,
    })
}

// ============================================================================
// Sequence allocation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCounter {
    Screenshot,
    Interaction,
}

impl SequenceCounter {
    fn column(&self) -> &'static str {
        match self {
            SequenceCounter::Screenshot => "screenshot_seq",
            SequenceCounter::Interaction => "interaction_seq",
        }
    }
}

/// Next sequence number for the session, or `explicit` with the counter
/// advanced to at least that value. 404 when the session is not the owner's.
pub async fn allocate_sequence(
    tx: &mut Transaction<'_, Postgres>,
    counter: SequenceCounter,
    session_id: Uuid,
    owner: Uuid,
    explicit: Option<i32>,
) -> ApiResult<i32> {
    if let Some(n) = explicit {
        if n < 1 {
            return Err(ApiError::validation("sequenceNumber must be a positive integer"));
        }
    }

    let column = counter.column();
    let allocated: Option<i32> = sqlx::query_scalar(&format!(
        r#"
        UPDATE capture_sessions
        SET {column} = CASE WHEN $3::int IS NULL THEN {column} + 1 ELSE GREATEST({column}, $3) END
        WHERE id = $1 AND user_id = $2
        RETURNING {column}
        "#
    ))
    .bind(session_id)
    .bind(owner)
    .bind(explicit)
    .fetch_optional(&mut **tx)
    .await?;

    let allocated = allocated.ok_or_else(|| ApiError::not_found("Capture session not found"))?;
    Ok(explicit.unwrap_or(allocated))
}

// ============================================================================
// Screenshots
// ============================================================================

/// A screenshot whose bytes are already in the object store.
#[derive(Debug, Clone)]
pub struct StoredScreenshot {
    pub storage_key: String,
    pub file_size: i64,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub mime_type: String,
    pub sequence: Option<i32>,
    pub page_url: Option<String>,
    pub page_title: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Allocate a sequence number and insert the row in one transaction. A
/// duplicate explicit sequence surfaces as 409 through the unique index.
pub async fn insert_screenshot(
    pool: &PgPool,
    session_id: Uuid,
    owner: Uuid,
    shot: StoredScreenshot,
) -> ApiResult<Screenshot> {
    let mut tx = pool.begin().await?;
    let sequence =
        allocate_sequence(&mut tx, SequenceCounter::Screenshot, session_id, owner, shot.sequence)
            .await?;

    let row = sqlx::query_as::<_, Screenshot>(&format!(
        r#"
        INSERT INTO screenshots (capture_session_id, sequence_number, storage_key, file_size,
                                 width, height, mime_type, page_url, page_title, metadata, captured_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, COALESCE($11, NOW()))
        RETURNING {SCREENSHOT_COLUMNS}
        "#
    ))
    .bind(session_id)
    .bind(sequence)
    .bind(&shot.storage_key)
    .bind(shot.file_size)
    .bind(shot.width)
    .bind(shot.height)
    .bind(&shot.mime_type)
    .bind(&shot.page_url)
    .bind(&shot.page_title)
    .bind(&shot.metadata)
    .bind(shot.captured_at)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(row)
}

/// Raw upload from the extension or the web client.
#[derive(Debug, Clone, Default)]
pub struct ScreenshotUpload {
    pub bytes: Vec<u8>,
    pub original_name: Option<String>,
    pub sequence: Option<i32>,
    pub page_url: Option<String>,
    pub page_title: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
}

/// Decode and bound the image on the blocking pool.
pub async fn normalize(bytes: Vec<u8>, capture: &CaptureConfig) -> Result<NormalizedImage, ApiError> {
    let (w, h) = (capture.max_width, capture.max_height);
    let normalized = tokio::task::spawn_blocking(move || normalize_screenshot(&bytes, w, h)).await??;
    Ok(normalized)
}

/// `screenshots/<sessionId>/<uuid>.png`
pub fn screenshot_key(session_id: Uuid) -> String {
    format!("screenshots/{}/{}.png", session_id, Uuid::new_v4())
}

/// Normalize, store and record one screenshot.
pub async fn add_screenshot(
    pool: &PgPool,
    store: &dyn ObjectStore,
    capture: &CaptureConfig,
    session_id: Uuid,
    owner: Uuid,
    upload: ScreenshotUpload,
) -> ApiResult<Screenshot> {
    owned_session(pool, session_id, owner).await?;

    let image = normalize(upload.bytes, capture).await?;
    let key = screenshot_key(session_id);
    store.put(&key, &image.bytes).await?;

    let shot = StoredScreenshot {
        storage_key: key.clone(),
        file_size: image.bytes.len() as i64,
        width: Some(image.width as i32),
        height: Some(image.height as i32),
        mime_type: NormalizedImage::MIME_TYPE.to_string(),
        sequence: upload.sequence,
        page_url: upload.page_url.clone(),
        page_title: upload.page_title.clone(),
        captured_at: upload.captured_at,
        metadata: serde_json::json!({
            "url": upload.page_url,
            "title": upload.page_title,
            "timestamp": upload.captured_at,
            "originalName": upload.original_name,
            "resized": image.resized,
        }),
    };

    match insert_screenshot(pool, session_id, owner, shot).await {
        Ok(row) => {
            tracing::debug!(
                session_id = %session_id,
                sequence = row.sequence_number,
                key = %row.storage_key,
                "Screenshot stored"
            );
            Ok(row)
        }
        Err(e) => {
            // The row is the only reference to the object.
            if let Err(cleanup) = store.delete(&key).await {
                tracing::warn!(key = %key, error = %cleanup, "Failed to remove orphaned screenshot");
            }
            Err(e)
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub uploaded: usize,
    pub screenshots: Vec<Screenshot>,
}

/// Multi-file variant. Files that fail to decode are skipped and logged.
pub async fn upload_screenshots(
    pool: &PgPool,
    store: &dyn ObjectStore,
    capture: &CaptureConfig,
    session_id: Uuid,
    owner: Uuid,
    files: Vec<ScreenshotUpload>,
) -> ApiResult<UploadSummary> {
    if files.is_empty() {
        return Err(ApiError::validation("No screenshots provided"));
    }
    if files.len() > capture.max_files_per_upload {
        return Err(ApiError::validation(format!(
            "At most {} screenshots per upload",
            capture.max_files_per_upload
        )));
    }

    owned_session(pool, session_id, owner).await?;

    let mut screenshots = Vec::with_capacity(files.len());
    for file in files {
        let name = file.original_name.clone().unwrap_or_default();
        match add_screenshot(pool, store, capture, session_id, owner, file).await {
            Ok(row) => screenshots.push(row),
            Err(ApiError::BadRequest { message, .. }) => {
                tracing::warn!(file = %name, error = %message, "Skipping undecodable screenshot");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(UploadSummary {
        uploaded: screenshots.len(),
        screenshots,
    })
}

// ============================================================================
// Interactions
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInteraction {
    #[serde(default)]
    pub interaction_type: String,
    pub element_selector: Option<String>,
    pub element_text: Option<String>,
    pub coordinates: Option<serde_json::Value>,
    pub input_value: Option<String>,
    /// HTML input type of the element, used to mask sensitive values.
    pub input_type: Option<String>,
    #[serde(alias = "pageUrl")]
    pub url: Option<String>,
    pub sequence_number: Option<i32>,
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

/// Mask sensitive input types and truncate long values.
pub fn sanitize_input_value(value: Option<&str>, input_type: Option<&str>) -> Option<String> {
    let value = value?;
    if input_type.is_some_and(|t| SENSITIVE_INPUT_TYPES.contains(&t.to_ascii_lowercase().as_str())) {
        return Some(REDACTED.to_string());
    }
    if value.chars().count() > MAX_INPUT_VALUE_CHARS {
        let head: String = value.chars().take(MAX_INPUT_VALUE_CHARS).collect();
        return Some(format!("{}...", head));
    }
    Some(value.to_string())
}

pub async fn record_interaction(
    pool: &PgPool,
    session_id: Uuid,
    owner: Uuid,
    new: NewInteraction,
) -> ApiResult<Interaction> {
    if new.interaction_type.trim().is_empty() {
        return Err(ApiError::validation("Interaction type is required"));
    }

    let input_type = new.input_type.clone().or_else(|| {
        new.metadata
            .as_ref()
            .and_then(|m| m.get("inputType"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    });
    let input_value = sanitize_input_value(new.input_value.as_deref(), input_type.as_deref());

    let mut tx = pool.begin().await?;
    let sequence = allocate_sequence(
        &mut tx,
        SequenceCounter::Interaction,
        session_id,
        owner,
        new.sequence_number,
    )
    .await?;

    let row = sqlx::query_as::<_, Interaction>(&format!(
        r#"
        INSERT INTO user_interactions (capture_session_id, sequence_number, interaction_type,
                                       element_selector, element_text, coordinates, input_value,
                                       page_url, metadata, occurred_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, COALESCE($10, NOW()))
        RETURNING {INTERACTION_COLUMNS}
        "#
    ))
    .bind(session_id)
    .bind(sequence)
    .bind(new.interaction_type.trim())
    .bind(&new.element_selector)
    .bind(&new.element_text)
    .bind(&new.coordinates)
    .bind(input_value)
    .bind(&new.url)
    .bind(new.metadata.unwrap_or_else(|| serde_json::json!({})))
    .bind(new.timestamp)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(row)
}

pub async fn list_interactions(
    pool: &PgPool,
    session_id: Uuid,
    owner: Uuid,
) -> ApiResult<Vec<Interaction>> {
    owned_session(pool, session_id, owner).await?;

    let rows = sqlx::query_as::<_, Interaction>(&format!(
        "SELECT {INTERACTION_COLUMNS} FROM user_interactions WHERE capture_session_id = $1 ORDER BY sequence_number"
    ))
    .bind(session_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ============================================================================
// Processing
// ============================================================================

/// Mark the session `processing` and queue a `generate` job.
pub async fn process_session(
    pool: &PgPool,
    jobs: &JobQueue,
    session_id: Uuid,
    owner: Uuid,
) -> ApiResult<Job> {
    let updated = sqlx::query(
        "UPDATE capture_sessions SET status = 'processing' WHERE id = $1 AND user_id = $2",
    )
    .bind(session_id)
    .bind(owner)
    .execute(pool)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(ApiError::not_found("Capture session not found"));
    }

    let job = jobs
        .enqueue(NewJob {
            user_id: owner,
            capture_session_id: Some(session_id),
            job_type: JobType::Generate,
            input_data: serde_json::json!({ "sessionId": session_id, "userId": owner }),
        })
        .await?;

    tracing::info!(session_id = %session_id, job_id = %job.id, "Capture processing queued");
    Ok(job)
}

#[derive(Debug)]
pub enum CaptureResult {
    Completed {
        guide_id: Uuid,
        guide: Option<Guide>,
        processing_time: Option<i64>,
    },
    Failed(String),
    InProgress(JobStatus),
}

pub async fn session_result(
    pool: &PgPool,
    jobs: &JobQueue,
    session_id: Uuid,
    owner: Uuid,
) -> ApiResult<CaptureResult> {
    owned_session(pool, session_id, owner).await?;

    let job = jobs
        .latest_for_session(session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("No processing job found"))?;

    match job.status {
        JobStatus::Completed => {
            let guide_id = job
                .output_data
                .as_ref()
                .and_then(|o| o.get("guideId"))
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| ApiError::internal("completed job has no guideId"))?;

            let guide = sqlx::query_as::<_, Guide>(&format!(
                "SELECT {GUIDE_COLUMNS} FROM guides WHERE id = $1"
            ))
            .bind(guide_id)
            .fetch_optional(pool)
            .await?;

            Ok(CaptureResult::Completed {
                guide_id,
                guide,
                processing_time: job.processing_time,
            })
        }
        JobStatus::Failed => Ok(CaptureResult::Failed(
            job.error_message
                .unwrap_or_else(|| "Processing failed".to_string()),
        )),
        other => Ok(CaptureResult::InProgress(other)),
    }
}
