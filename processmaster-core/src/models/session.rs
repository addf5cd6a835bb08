use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

text_enum! {
    /// Lifecycle of a recording session. Sessions are never hard-deleted.
    pub enum SessionStatus: "session status" {
        Active => "active",
        Stopped => "stopped",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    pub browser_info: serde_json::Value,
    pub screen_resolution: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Column list matching [`CaptureSession`], for `RETURNING` clauses.
pub const SESSION_COLUMNS: &str = "id, user_id, title, description, status, browser_info, \
     screen_resolution, started_at, stopped_at, processed_at, created_at, updated_at";
