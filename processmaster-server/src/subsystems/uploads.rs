//! Upload gateway: presigned uploads, confirmation, downloads and deletion
//! against the object store.
//!
//! A caller owns a key when it sits under their `<uploadType>/<userId>/`
//! prefix or when a screenshot row in one of their sessions points at it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use processmaster_core::models::{Role, Screenshot};
use processmaster_core::storage::{
    content_type_for, generate_key, validate_key, ObjectMeta, SignedMethod, SignedUrl,
};
use processmaster_core::ObjectStore;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::auth::AuthUser;
use super::capture::{insert_screenshot, StoredScreenshot};
use crate::error::{ApiError, ApiResult};

pub const UPLOAD_URL_TTL_SECS: u64 = 900;
pub const DEFAULT_DOWNLOAD_TTL_SECS: u64 = 3600;
pub const MAX_DOWNLOAD_TTL_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadType {
    Screenshot,
    Export,
    ProfileImage,
}

impl UploadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadType::Screenshot => "screenshot",
            UploadType::Export => "export",
            UploadType::ProfileImage => "profile-image",
        }
    }

    pub fn parse(raw: &str) -> ApiResult<Self> {
        match raw {
            "screenshot" => Ok(UploadType::Screenshot),
            "export" => Ok(UploadType::Export),
            "profile-image" => Ok(UploadType::ProfileImage),
            _ => Err(ApiError::validation("Invalid upload type")),
        }
    }
}

/// `<uploadType>/<userId>/<YYYY-MM-DD>/<uuid>_<filename>`
pub fn upload_key(upload_type: UploadType, user_id: Uuid, filename: &str, now: DateTime<Utc>) -> String {
    generate_key(&format!("{}/{}", upload_type.as_str(), user_id), filename, now)
}

fn user_prefix_owner(key: &str) -> Option<Uuid> {
    let mut parts = key.splitn(3, '/');
    let kind = parts.next()?;
    UploadType::parse(kind).ok()?;
    parts.next()?.parse().ok()
}

pub async fn caller_owns_key(pool: &PgPool, key: &str, user: &AuthUser) -> ApiResult<bool> {
    if user.has_role(Role::Admin) || user_prefix_owner(key) == Some(user.id) {
        return Ok(true);
    }
    let owned: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM screenshots s
            JOIN capture_sessions cs ON cs.id = s.capture_session_id
            WHERE s.storage_key = $1 AND cs.user_id = $2
        )
        "#,
    )
    .bind(key)
    .bind(user.id)
    .fetch_one(pool)
    .await?;
    Ok(owned)
}

pub async fn require_key_owner(pool: &PgPool, key: &str, user: &AuthUser) -> ApiResult<()> {
    validate_key(key)?;
    if !caller_owns_key(pool, key, user).await? {
        return Err(ApiError::forbidden("Access denied to this file"));
    }
    Ok(())
}

// ============================================================================
// Presigned uploads
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub upload_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUpload {
    pub upload_url: String,
    pub key: String,
    pub bucket: String,
    pub expires_in: u64,
}

pub fn presign_upload(
    store: &dyn ObjectStore,
    user_id: Uuid,
    req: &PresignRequest,
) -> ApiResult<PresignedUpload> {
    let non_empty = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
    let (Some(filename), Some(_content_type), Some(upload_type)) = (
        non_empty(&req.filename),
        non_empty(&req.content_type),
        non_empty(&req.upload_type),
    ) else {
        return Err(ApiError::validation(
            "Missing required fields: filename, contentType, uploadType",
        ));
    };
    let upload_type = UploadType::parse(&upload_type)?;

    let key = upload_key(upload_type, user_id, &filename, Utc::now());
    let signed = store.presign(
        SignedMethod::Put,
        &key,
        Duration::from_secs(UPLOAD_URL_TTL_SECS),
    )?;

    tracing::debug!(key = %key, user_id = %user_id, "Presigned upload issued");
    Ok(PresignedUpload {
        upload_url: signed.url,
        key,
        bucket: store.bucket().to_string(),
        expires_in: UPLOAD_URL_TTL_SECS,
    })
}

/// Stores the body of a signed PUT. The signature is the only credential.
pub async fn put_signed_object(
    store: &dyn ObjectStore,
    key: &str,
    expires: i64,
    signature: &str,
    bytes: &[u8],
    max_bytes: usize,
) -> ApiResult<ObjectMeta> {
    store.verify(SignedMethod::Put, key, expires, signature)?;
    if bytes.len() > max_bytes {
        return Err(ApiError::PayloadTooLarge {
            code: "FILE_TOO_LARGE",
            message: format!("Uploads are limited to {} bytes", max_bytes),
        });
    }
    Ok(store.put(key, bytes).await?)
}

/// Bytes and content type for a signed GET.
pub async fn get_signed_object(
    store: &dyn ObjectStore,
    key: &str,
    expires: i64,
    signature: &str,
) -> ApiResult<(Vec<u8>, String)> {
    store.verify(SignedMethod::Get, key, expires, signature)?;
    let bytes = store.get(key).await?;
    Ok((bytes, content_type_for(key)))
}

// ============================================================================
// Confirmation
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmUpload {
    pub key: Option<String>,
    pub upload_type: Option<String>,
    pub metadata: Option<ConfirmMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmMetadata {
    pub capture_session_id: Option<Uuid>,
    pub step_number: Option<i32>,
    pub page_url: Option<String>,
    pub page_title: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedUpload {
    pub key: String,
    pub url: String,
    pub metadata: ObjectMeta,
    pub record: Option<Screenshot>,
}

pub async fn confirm_upload(
    pool: &PgPool,
    store: &dyn ObjectStore,
    user: &AuthUser,
    req: ConfirmUpload,
) -> ApiResult<ConfirmedUpload> {
    let (Some(key), Some(upload_type)) = (req.key, req.upload_type) else {
        return Err(ApiError::validation("Missing required fields: key, uploadType"));
    };
    let upload_type = UploadType::parse(&upload_type)?;
    require_key_owner(pool, &key, user).await?;

    let meta = store
        .head(&key)
        .await?
        .ok_or_else(|| ApiError::not_found("File not found in storage"))?;

    let record = match (upload_type, req.metadata) {
        (
            UploadType::Screenshot,
            Some(ConfirmMetadata {
                capture_session_id: Some(session_id),
                step_number,
                page_url,
                page_title,
            }),
        ) => {
            let shot = StoredScreenshot {
                storage_key: key.clone(),
                file_size: meta.size as i64,
                width: None,
                height: None,
                mime_type: meta.content_type.clone(),
                sequence: step_number,
                page_url,
                page_title,
                captured_at: None,
                metadata: serde_json::json!({ "confirmedUpload": true }),
            };
            Some(insert_screenshot(pool, session_id, user.id, shot).await?)
        }
        _ => None,
    };

    let url = store
        .presign(
            SignedMethod::Get,
            &key,
            Duration::from_secs(DEFAULT_DOWNLOAD_TTL_SECS),
        )?
        .url;

    Ok(ConfirmedUpload {
        key,
        url,
        metadata: meta,
        record,
    })
}

// ============================================================================
// Download / delete / list
// ============================================================================

pub async fn download_url(
    pool: &PgPool,
    store: &dyn ObjectStore,
    user: &AuthUser,
    key: &str,
    expiration_secs: Option<u64>,
) -> ApiResult<SignedUrl> {
    let ttl = expiration_secs.unwrap_or(DEFAULT_DOWNLOAD_TTL_SECS);
    if ttl == 0 || ttl > MAX_DOWNLOAD_TTL_SECS {
        return Err(ApiError::validation(format!(
            "expirationTime must be between 1 and {} seconds",
            MAX_DOWNLOAD_TTL_SECS
        )));
    }
    require_key_owner(pool, key, user).await?;
    if store.head(key).await?.is_none() {
        return Err(ApiError::not_found("File not found"));
    }
    Ok(store.presign(SignedMethod::Get, key, Duration::from_secs(ttl))?)
}

/// Removes the object and any screenshot rows that reference it.
pub async fn delete_file(
    pool: &PgPool,
    store: &dyn ObjectStore,
    user: &AuthUser,
    key: &str,
) -> ApiResult<u64> {
    require_key_owner(pool, key, user).await?;
    if store.head(key).await?.is_none() {
        return Err(ApiError::not_found("File not found"));
    }

    store.delete(key).await?;
    let rows = sqlx::query("DELETE FROM screenshots WHERE storage_key = $1")
        .bind(key)
        .execute(pool)
        .await?
        .rows_affected();

    tracing::info!(key = %key, user_id = %user.id, screenshot_rows = rows, "File deleted");
    Ok(rows)
}

#[derive(Debug, Default, Deserialize)]
pub struct ListFiles {
    /// Mime type prefix such as `image`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub id: Uuid,
    pub storage_key: String,
    pub sequence_number: i32,
    pub file_size: i64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    pub capture_session_id: Uuid,
    pub capture_session_title: String,
}

#[derive(Debug, Serialize)]
pub struct FilePage {
    pub files: Vec<FileEntry>,
    pub pagination: FilePagination,
}

#[derive(Debug, Serialize)]
pub struct FilePagination {
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
}

pub async fn list_files(pool: &PgPool, user_id: Uuid, query: &ListFiles) -> ApiResult<FilePage> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let offset = query.offset.unwrap_or(0).max(0);
    let mime_prefix = query
        .kind
        .as_deref()
        .filter(|k| !k.is_empty())
        .map(|k| format!("{}%", k.replace('%', "").replace('_', "")));

    let files = sqlx::query_as::<_, FileEntry>(
        r#"
        SELECT s.id, s.storage_key, s.sequence_number, s.file_size, s.mime_type, s.created_at,
               cs.id AS capture_session_id, cs.title AS capture_session_title
        FROM screenshots s
        JOIN capture_sessions cs ON cs.id = s.capture_session_id
        WHERE cs.user_id = $1 AND ($2::text IS NULL OR s.mime_type LIKE $2)
        ORDER BY s.created_at DESC
        LIMIT $3 OFFSET $4
        "#,
    )
    .bind(user_id)
    .bind(&mime_prefix)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM screenshots s
        JOIN capture_sessions cs ON cs.id = s.capture_session_id
        WHERE cs.user_id = $1 AND ($2::text IS NULL OR s.mime_type LIKE $2)
        "#,
    )
    .bind(user_id)
    .bind(&mime_prefix)
    .fetch_one(pool)
    .await?;

    Ok(FilePage {
        files,
        pagination: FilePagination {
            limit,
            offset,
            total,
        },
    })
}
