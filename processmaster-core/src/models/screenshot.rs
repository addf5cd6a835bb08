use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A normalized PNG frame belonging to a capture session. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Screenshot {
    pub id: Uuid,
    pub capture_session_id: Uuid,
    pub sequence_number: i32,
    pub storage_key: String,
    pub file_size: i64,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub mime_type: String,
    pub page_url: Option<String>,
    pub page_title: Option<String>,
    pub metadata: serde_json::Value,
    pub captured_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

pub const SCREENSHOT_COLUMNS: &str = "id, capture_session_id, sequence_number, storage_key, \
     file_size, width, height, mime_type, page_url, page_title, metadata, captured_at, created_at";
