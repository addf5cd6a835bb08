use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

text_enum! {
    pub enum GuideStatus: "guide status" {
        Draft => "draft",
        Published => "published",
    }
}

text_enum! {
    pub enum Visibility: "visibility" {
        Private => "private",
        Organization => "organization",
        Public => "public",
    }
}

text_enum! {
    pub enum Difficulty: "difficulty" {
        Beginner => "beginner",
        Intermediate => "intermediate",
        Advanced => "advanced",
    }
}

text_enum! {
    pub enum CollaboratorRole: "collaborator role" {
        Viewer => "viewer",
        Editor => "editor",
    }
}

impl Difficulty {
    /// Difficulty is a pure function of how many steps a guide has.
    pub fn from_step_count(steps: usize) -> Self {
        if steps > 10 {
            Difficulty::Advanced
        } else if steps > 5 {
            Difficulty::Intermediate
        } else {
            Difficulty::Beginner
        }
    }
}

impl Visibility {
    /// Whether a non-owner, non-collaborator may read the guide.
    pub fn is_shared(&self) -> bool {
        matches!(self, Visibility::Public | Visibility::Organization)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Guide {
    pub id: Uuid,
    pub user_id: Uuid,
    pub capture_session_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub content: serde_json::Value,
    pub tags: Vec<String>,
    #[sqlx(try_from = "String")]
    pub status: GuideStatus,
    #[sqlx(try_from = "String")]
    pub visibility: Visibility,
    pub difficulty: Option<String>,
    pub estimated_time: Option<String>,
    pub view_count: i32,
    pub like_count: i32,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

pub const GUIDE_COLUMNS: &str = "id, user_id, capture_session_id, title, description, content, tags, \
     status, visibility, difficulty, estimated_time, view_count, like_count, version, created_at, \
     updated_at, published_at";

/// List row: a guide plus its step count and the owner's display name.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct GuideSummary {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    #[sqlx(try_from = "String")]
    pub status: GuideStatus,
    #[sqlx(try_from = "String")]
    pub visibility: Visibility,
    pub difficulty: Option<String>,
    pub estimated_time: Option<String>,
    pub view_count: i32,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub step_count: i64,
    pub author_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct GuideStep {
    pub id: Uuid,
    pub guide_id: Uuid,
    pub step_number: i32,
    pub title: String,
    pub description: String,
    pub action_type: Option<String>,
    pub element_description: Option<String>,
    pub screenshot_id: Option<Uuid>,
    /// Object-store key of the step's screenshot, joined in on read.
    pub screenshot_key: Option<String>,
    pub coordinates: Option<serde_json::Value>,
    pub tips: Vec<String>,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difficulty_thresholds() {
        assert_eq!(Difficulty::from_step_count(11), Difficulty::Advanced);
        assert_eq!(Difficulty::from_step_count(10), Difficulty::Intermediate);
        assert_eq!(Difficulty::from_step_count(6), Difficulty::Intermediate);
        assert_eq!(Difficulty::from_step_count(5), Difficulty::Beginner);
        assert_eq!(Difficulty::from_step_count(1), Difficulty::Beginner);
        assert_eq!(Difficulty::from_step_count(0), Difficulty::Beginner);
    }

    #[test]
    fn test_visibility_sharing() {
        assert!(Visibility::Public.is_shared());
        assert!(Visibility::Organization.is_shared());
        assert!(!Visibility::Private.is_shared());
    }

    #[test]
    fn test_enums_serialize_lowercase() {
        assert_eq!(serde_json::to_value(GuideStatus::Published).unwrap(), "published");
        let v: Visibility = serde_json::from_value(serde_json::json!("organization")).unwrap();
        assert_eq!(v, Visibility::Organization);
    }
}
