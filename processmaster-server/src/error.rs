//! Error type shared by the subsystems and the HTTP boundary.
//!
//! Every failure is reduced to `(status, code, message)` in one place.
//! Database errors are translated here and nowhere else.

use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use processmaster_core::db::{sqlstate, FOREIGN_KEY_VIOLATION, NOT_NULL_VIOLATION, UNIQUE_VIOLATION};
use processmaster_core::{AiServiceError, ApiResponse, ErrorBody, ImageError, StorageError};
use thiserror::Error;
use uuid::Uuid;

pub type ApiResult<T> = Result<T, ApiError>;

/// Outside production, error bodies carry the original error text.
static EXPOSE_DETAIL: AtomicBool = AtomicBool::new(false);

pub fn set_expose_detail(expose: bool) {
    EXPOSE_DETAIL.store(expose, Ordering::Relaxed);
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{message}")]
    Validation {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("{message}")]
    BadRequest { code: &'static str, message: String },

    #[error("{message}")]
    Unauthorized { code: &'static str, message: String },

    #[error("{message}")]
    Forbidden { code: &'static str, message: String },

    #[error("{0}")]
    NotFound(String),

    #[error("{message}")]
    Conflict { code: &'static str, message: String },

    #[error("{message}")]
    PayloadTooLarge { code: &'static str, message: String },

    #[error("Too many requests")]
    RateLimited { retry_after_secs: u64 },

    #[error("{message}")]
    Upstream { code: &'static str, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Forbidden {
            code: "FORBIDDEN",
            message: message.into(),
        }
    }

    pub fn unauthorized(code: &'static str, message: impl Into<String>) -> Self {
        ApiError::Unauthorized {
            code,
            message: message.into(),
        }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        ApiError::Conflict {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal(message.into())
    }

    /// Status, machine-readable code and client-facing message.
    pub fn classify(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Validation { message, .. } => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message.clone())
            }
            ApiError::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message.clone()),
            ApiError::Unauthorized { code, message } => {
                (StatusCode::UNAUTHORIZED, code, message.clone())
            }
            ApiError::Forbidden { code, message } => (StatusCode::FORBIDDEN, code, message.clone()),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "NOT_FOUND", message.clone()),
            ApiError::Conflict { code, message } => (StatusCode::CONFLICT, code, message.clone()),
            ApiError::PayloadTooLarge { code, message } => {
                (StatusCode::PAYLOAD_TOO_LARGE, code, message.clone())
            }
            ApiError::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMIT_EXCEEDED",
                "Too many requests, please try again later.".to_string(),
            ),
            ApiError::Upstream { code, message } => {
                (StatusCode::SERVICE_UNAVAILABLE, code, message.clone())
            }
            ApiError::Database(e) => classify_database(e),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error".to_string(),
            ),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::Validation { details, .. } => details.clone(),
            _ => None,
        }
    }
}

fn classify_database(e: &sqlx::Error) -> (StatusCode, &'static str, String) {
    match e {
        sqlx::Error::RowNotFound => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Resource not found".to_string(),
        ),
        sqlx::Error::PoolTimedOut => (
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_TIMEOUT",
            "Database temporarily unavailable".to_string(),
        ),
        _ => match sqlstate(e).as_deref() {
            Some(UNIQUE_VIOLATION) => (
                StatusCode::CONFLICT,
                "DUPLICATE_ENTRY",
                "Duplicate entry. This resource already exists.".to_string(),
            ),
            Some(FOREIGN_KEY_VIOLATION) => (
                StatusCode::BAD_REQUEST,
                "INVALID_REFERENCE",
                "Referenced resource does not exist.".to_string(),
            ),
            Some(NOT_NULL_VIOLATION) => (
                StatusCode::BAD_REQUEST,
                "MISSING_FIELD",
                "Required field is missing.".to_string(),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database operation failed.".to_string(),
            ),
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.classify();
        let error_id = format!("err_{}", Uuid::new_v4().simple());

        if status.is_server_error() {
            tracing::error!(error_id = %error_id, code = code, error = %self, "Request failed");
        } else {
            tracing::warn!(error_id = %error_id, code = code, error = %self, "Request rejected");
        }

        let detail = if EXPOSE_DETAIL.load(Ordering::Relaxed) && status.is_server_error() {
            Some(self.to_string())
        } else {
            None
        };

        let body = ApiResponse::err(ErrorBody {
            message,
            code: code.to_string(),
            error_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            details: self.details(),
            detail,
        });

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after_secs } = self {
            if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("retry-after", v);
            }
        }
        response
    }
}

impl From<AiServiceError> for ApiError {
    fn from(e: AiServiceError) -> Self {
        match e {
            AiServiceError::MissingApiKey => ApiError::Upstream {
                code: "AI_NOT_CONFIGURED",
                message: "AI service is not configured".to_string(),
            },
            e => ApiError::Upstream {
                code: "AI_SERVICE_ERROR",
                message: format!("AI service unavailable: {}", e),
            },
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => ApiError::NotFound(format!("File not found: {}", key)),
            StorageError::InvalidKey(key) => ApiError::validation(format!("Invalid file key: {}", key)),
            StorageError::Expired => ApiError::Forbidden {
                code: "URL_EXPIRED",
                message: "Signed URL has expired".to_string(),
            },
            StorageError::BadSignature => ApiError::Forbidden {
                code: "INVALID_SIGNATURE",
                message: "Signed URL is invalid".to_string(),
            },
            StorageError::Io(io) => ApiError::Upstream {
                code: "STORAGE_ERROR",
                message: format!("Object store failure: {}", io),
            },
        }
    }
}

impl From<ImageError> for ApiError {
    fn from(e: ImageError) -> Self {
        ApiError::BadRequest {
            code: "INVALID_IMAGE",
            message: e.to_string(),
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(e: axum::extract::multipart::MultipartError) -> Self {
        let status = e.status();
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge {
                code: "FILE_TOO_LARGE",
                message: "File too large".to_string(),
            }
        } else {
            ApiError::validation(format!("Malformed multipart body: {}", e.body_text()))
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("background task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_classify_codes() {
        assert_eq!(ApiError::validation("x").classify().0, StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::not_found("x").classify().1, "NOT_FOUND");
        assert_eq!(
            ApiError::conflict("VERSION_CONFLICT", "x").classify().0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::RateLimited { retry_after_secs: 1 }.classify().1,
            "RATE_LIMIT_EXCEEDED"
        );
        assert_eq!(
            ApiError::from(sqlx::Error::RowNotFound).classify().0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(sqlx::Error::PoolTimedOut).classify(),
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_TIMEOUT",
                "Database temporarily unavailable".to_string()
            )
        );
    }

    #[test]
    fn test_upstream_mappings() {
        let e: ApiError = AiServiceError::MissingApiKey.into();
        assert_eq!(e.classify().0, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(e.classify().1, "AI_NOT_CONFIGURED");

        let e: ApiError = AiServiceError::EmptyResponse.into();
        assert_eq!(e.classify().0, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(e.classify().1, "AI_SERVICE_ERROR");

        let e: ApiError = StorageError::BadSignature.into();
        assert_eq!(e.classify().0, StatusCode::FORBIDDEN);

        let e: ApiError = StorageError::NotFound("k".into()).into();
        assert_eq!(e.classify().0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let resp = ApiError::validation("title is required").into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let v = body_json(resp).await;
        assert_eq!(v["success"], false);
        assert_eq!(v["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(v["error"]["message"], "title is required");
        assert!(v["error"]["errorId"].as_str().unwrap().starts_with("err_"));
        assert!(v["error"]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_internal_message_is_masked() {
        let resp = ApiError::internal("connection string leaked: secret").into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let v = body_json(resp).await;
        assert_eq!(v["error"]["message"], "Internal server error");
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let resp = ApiError::RateLimited { retry_after_secs: 7 }.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "7");
    }
}
