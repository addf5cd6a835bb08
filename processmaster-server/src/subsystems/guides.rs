//! Guide repository: list, create, read, update, delete.
//!
//! Read access is owner, collaborator, or anyone for `public` and
//! `organization` guides. Writes need ownership or an `editor` collaborator
//! row; deletes need ownership or an admin role.

use processmaster_core::models::guide::GUIDE_COLUMNS;
use processmaster_core::models::{
    CollaboratorRole, Difficulty, Guide, GuideStatus, GuideStep, GuideSummary, Role, Visibility,
};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::auth::AuthUser;
use crate::error::{ApiError, ApiResult};

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

const GUIDE_NOT_FOUND: &str = "Guide not found";

// ============================================================================
// Listing
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListGuides {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub status: Option<GuideStatus>,
    pub search: Option<String>,
    /// Comma-separated; matches guides carrying any of them.
    pub tags: Option<String>,
}

impl ListGuides {
    /// `(page, limit)` with page >= 1 and limit clamped to 1..=100.
    pub fn window(&self) -> (i64, i64) {
        let page = self.page.unwrap_or(1).max(1);
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        (page, limit)
    }

    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub pages: i64,
}

impl Pagination {
    pub fn new(page: i64, limit: i64, total: i64) -> Self {
        let pages = if total == 0 { 0 } else { (total + limit - 1) / limit };
        Self {
            page,
            limit,
            total,
            pages,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GuideList {
    pub guides: Vec<GuideSummary>,
    pub pagination: Pagination,
}

/// Escapes `%`, `_` and `\` so user input matches literally under ILIKE.
fn like_pattern(search: &str) -> String {
    let mut escaped = String::with_capacity(search.len() + 2);
    escaped.push('%');
    for c in search.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn push_list_filters(qb: &mut QueryBuilder<'_, Postgres>, viewer: Uuid, query: &ListGuides) {
    qb.push(" WHERE (g.user_id = ")
        .push_bind(viewer)
        .push(" OR g.visibility = 'public')");

    if let Some(status) = query.status {
        qb.push(" AND g.status = ").push_bind(status.as_str());
    }

    if let Some(search) = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = like_pattern(search);
        qb.push(" AND (g.title ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR g.description ILIKE ")
            .push_bind(pattern)
            .push(")");
    }

    let tags = query.tag_list();
    if !tags.is_empty() {
        qb.push(" AND g.tags && ").push_bind(tags);
    }
}

pub async fn list_guides(pool: &PgPool, viewer: Uuid, query: &ListGuides) -> ApiResult<GuideList> {
    let (page, limit) = query.window();

    let mut qb = QueryBuilder::<Postgres>::new(
        r#"
        SELECT g.id, g.user_id, g.title, g.description, g.tags, g.status, g.visibility,
               g.difficulty, g.estimated_time, g.view_count, g.version, g.created_at, g.updated_at,
               (SELECT COUNT(*) FROM guide_steps gs WHERE gs.guide_id = g.id) AS step_count,
               u.email AS author_email
        FROM guides g
        LEFT JOIN users u ON u.id = g.user_id
        "#,
    );
    push_list_filters(&mut qb, viewer, query);
    qb.push(" ORDER BY g.created_at DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind((page - 1) * limit);

    let guides = qb.build_query_as::<GuideSummary>().fetch_all(pool).await?;

    let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM guides g");
    push_list_filters(&mut count, viewer, query);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    Ok(GuideList {
        guides,
        pagination: Pagination::new(page, limit, total),
    })
}

// ============================================================================
// Create
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGuide {
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<serde_json::Value>,
    pub tags: Option<Vec<String>>,
    pub visibility: Option<Visibility>,
    pub estimated_time: Option<String>,
    pub difficulty: Option<Difficulty>,
}

pub async fn create_guide(pool: &PgPool, owner: Uuid, req: CreateGuide) -> ApiResult<Guide> {
    let title = req.title.filter(|t| !t.trim().is_empty());
    let description = req.description.filter(|d| !d.trim().is_empty());
    let (Some(title), Some(description)) = (title, description) else {
        return Err(ApiError::validation("Title and description are required"));
    };

    let guide = sqlx::query_as::<_, Guide>(&format!(
        r#"
        INSERT INTO guides (user_id, title, description, content, tags, visibility, estimated_time, difficulty)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {GUIDE_COLUMNS}
        "#
    ))
    .bind(owner)
    .bind(title)
    .bind(description)
    .bind(req.content.unwrap_or_else(|| serde_json::json!({})))
    .bind(req.tags.unwrap_or_default())
    .bind(req.visibility.unwrap_or(Visibility::Private).as_str())
    .bind(req.estimated_time)
    .bind(req.difficulty.map(|d| d.as_str()))
    .fetch_one(pool)
    .await?;

    tracing::info!(guide_id = %guide.id, user_id = %owner, "Guide created");
    Ok(guide)
}

// ============================================================================
// Read
// ============================================================================

/// How the caller relates to a guide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuideAccess {
    Owner,
    Collaborator(CollaboratorRole),
    /// Readable only because of its visibility.
    Visible,
}

impl GuideAccess {
    pub fn can_edit(&self) -> bool {
        matches!(
            self,
            GuideAccess::Owner | GuideAccess::Collaborator(CollaboratorRole::Editor)
        )
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AccessRow {
    user_id: Uuid,
    visibility: String,
    collaborator_role: Option<String>,
}

/// Resolves the caller's access; 404 when the guide is missing or not
/// readable by them.
pub async fn resolve_access(pool: &PgPool, guide_id: Uuid, user_id: Uuid) -> ApiResult<GuideAccess> {
    let row = sqlx::query_as::<_, AccessRow>(
        r#"
        SELECT g.user_id, g.visibility,
               (SELECT gc.role FROM guide_collaborators gc
                WHERE gc.guide_id = g.id AND gc.user_id = $2) AS collaborator_role
        FROM guides g WHERE g.id = $1
        "#,
    )
    .bind(guide_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found(GUIDE_NOT_FOUND))?;

    if row.user_id == user_id {
        return Ok(GuideAccess::Owner);
    }
    if let Some(role) = row.collaborator_role.and_then(|r| r.parse().ok()) {
        return Ok(GuideAccess::Collaborator(role));
    }
    match row.visibility.parse::<Visibility>() {
        Ok(v) if v.is_shared() => Ok(GuideAccess::Visible),
        _ => Err(ApiError::not_found(GUIDE_NOT_FOUND)),
    }
}

/// 404 for a missing guide, 403 for one the caller does not own.
pub async fn require_owner(pool: &PgPool, guide_id: Uuid, user_id: Uuid) -> ApiResult<()> {
    let owner: Uuid = sqlx::query_scalar("SELECT user_id FROM guides WHERE id = $1")
        .bind(guide_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found(GUIDE_NOT_FOUND))?;
    if owner != user_id {
        return Err(ApiError::forbidden("Only the guide owner can do this"));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuideWithSteps {
    #[serde(flatten)]
    pub guide: Guide,
    pub steps: Vec<GuideStep>,
}

pub async fn load_steps(pool: &PgPool, guide_id: Uuid) -> ApiResult<Vec<GuideStep>> {
    let steps = sqlx::query_as::<_, GuideStep>(
        r#"
        SELECT gs.id, gs.guide_id, gs.step_number, gs.title, gs.description, gs.action_type,
               gs.element_description, gs.screenshot_id, s.storage_key AS screenshot_key,
               gs.coordinates, gs.tips, gs.warnings
        FROM guide_steps gs
        LEFT JOIN screenshots s ON s.id = gs.screenshot_id
        WHERE gs.guide_id = $1
        ORDER BY gs.step_number
        "#,
    )
    .bind(guide_id)
    .fetch_all(pool)
    .await?;
    Ok(steps)
}

/// Fetches a guide with no access check and no view counting.
pub async fn fetch_guide(pool: &PgPool, guide_id: Uuid) -> ApiResult<Guide> {
    sqlx::query_as::<_, Guide>(&format!("SELECT {GUIDE_COLUMNS} FROM guides WHERE id = $1"))
        .bind(guide_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found(GUIDE_NOT_FOUND))
}

/// Reads a guide with its steps. Non-owner reads bump `view_count` once.
pub async fn get_guide(pool: &PgPool, guide_id: Uuid, viewer: Uuid) -> ApiResult<GuideWithSteps> {
    let access = resolve_access(pool, guide_id, viewer).await?;

    let guide = if access == GuideAccess::Owner {
        fetch_guide(pool, guide_id).await?
    } else {
        sqlx::query_as::<_, Guide>(&format!(
            "UPDATE guides SET view_count = view_count + 1 WHERE id = $1 RETURNING {GUIDE_COLUMNS}"
        ))
        .bind(guide_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found(GUIDE_NOT_FOUND))?
    };

    let steps = load_steps(pool, guide_id).await?;
    Ok(GuideWithSteps { guide, steps })
}

// ============================================================================
// Update / delete
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGuide {
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<serde_json::Value>,
    pub tags: Option<Vec<String>>,
    pub visibility: Option<Visibility>,
    pub estimated_time: Option<String>,
    pub difficulty: Option<Difficulty>,
    pub status: Option<GuideStatus>,
    /// When present, the update only applies at this version.
    pub expected_version: Option<i32>,
}

/// Appends the `SET` list. Returns false when the request changes nothing.
fn push_updates(qb: &mut QueryBuilder<'_, Postgres>, req: &UpdateGuide) -> ApiResult<bool> {
    let mut fields = 0usize;
    let mut set = qb.separated(", ");

    if let Some(title) = &req.title {
        if title.trim().is_empty() {
            return Err(ApiError::validation("Title cannot be empty"));
        }
        set.push("title = ").push_bind_unseparated(title.clone());
        fields += 1;
    }
    if let Some(description) = &req.description {
        set.push("description = ").push_bind_unseparated(description.clone());
        fields += 1;
    }
    if let Some(content) = &req.content {
        set.push("content = ").push_bind_unseparated(content.clone());
        fields += 1;
    }
    if let Some(tags) = &req.tags {
        set.push("tags = ").push_bind_unseparated(tags.clone());
        fields += 1;
    }
    if let Some(visibility) = req.visibility {
        set.push("visibility = ").push_bind_unseparated(visibility.as_str());
        fields += 1;
    }
    if let Some(estimated_time) = &req.estimated_time {
        set.push("estimated_time = ").push_bind_unseparated(estimated_time.clone());
        fields += 1;
    }
    if let Some(difficulty) = req.difficulty {
        set.push("difficulty = ").push_bind_unseparated(difficulty.as_str());
        fields += 1;
    }
    if let Some(status) = req.status {
        set.push("status = ").push_bind_unseparated(status.as_str());
        if status == GuideStatus::Published {
            set.push("published_at = NOW()");
        }
        fields += 1;
    }

    if fields == 0 {
        return Ok(false);
    }
    set.push("version = version + 1");
    Ok(true)
}

pub async fn update_guide(
    pool: &PgPool,
    guide_id: Uuid,
    user_id: Uuid,
    req: &UpdateGuide,
) -> ApiResult<Guide> {
    let access = resolve_access(pool, guide_id, user_id).await?;
    if !access.can_edit() {
        return Err(ApiError::forbidden("You do not have permission to edit this guide"));
    }

    let mut qb = QueryBuilder::<Postgres>::new("UPDATE guides SET ");
    if !push_updates(&mut qb, req)? {
        return Err(ApiError::validation("No valid updates provided"));
    }
    qb.push(" WHERE id = ").push_bind(guide_id);
    if let Some(expected) = req.expected_version {
        qb.push(" AND version = ").push_bind(expected);
    }
    qb.push(format!(" RETURNING {GUIDE_COLUMNS}"));

    let updated = qb.build_query_as::<Guide>().fetch_optional(pool).await?;
    match updated {
        Some(guide) => {
            tracing::info!(guide_id = %guide_id, version = guide.version, "Guide updated");
            Ok(guide)
        }
        None if req.expected_version.is_some() => Err(ApiError::conflict(
            "VERSION_CONFLICT",
            "Guide was modified by someone else; reload and retry",
        )),
        None => Err(ApiError::not_found(GUIDE_NOT_FOUND)),
    }
}

pub async fn delete_guide(pool: &PgPool, guide_id: Uuid, user: &AuthUser) -> ApiResult<()> {
    let owner: Uuid = sqlx::query_scalar("SELECT user_id FROM guides WHERE id = $1")
        .bind(guide_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::not_found(GUIDE_NOT_FOUND))?;

    if owner != user.id && !user.has_role(Role::Admin) {
        return Err(ApiError::forbidden("Insufficient permissions to delete this guide"));
    }

    sqlx::query("DELETE FROM guides WHERE id = $1")
        .bind(guide_id)
        .execute(pool)
        .await?;

    tracing::info!(guide_id = %guide_id, user_id = %user.id, "Guide deleted");
    Ok(())
}
