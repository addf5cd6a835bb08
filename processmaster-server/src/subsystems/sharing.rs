//! Share links and collaborators.

use chrono::{DateTime, Utc};
use processmaster_core::models::{Collaborator, CollaboratorRole, SharedLink};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::auth::tokens;
use super::guides::{fetch_guide, load_steps, require_owner, resolve_access, GuideWithSteps};
use crate::error::{ApiError, ApiResult};

const SHARED_LINK_COLUMNS: &str =
    "id, guide_id, created_by, token, password_hash, expires_at, max_views, view_count, created_at";

// ============================================================================
// Share links
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRequest {
    pub password: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_views: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareResponse {
    pub share_url: String,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_views: Option<i32>,
}

pub fn share_url(web_base_url: &str, token: &str) -> String {
    format!("{}/shared/{}", web_base_url.trim_end_matches('/'), token)
}

fn validate_share(req: &ShareRequest, now: DateTime<Utc>) -> ApiResult<()> {
    if req.expires_at.is_some_and(|at| at <= now) {
        return Err(ApiError::validation("expiresAt must be in the future"));
    }
    if req.max_views.is_some_and(|max| max < 1) {
        return Err(ApiError::validation("maxViews must be at least 1"));
    }
    if req.password.as_deref().is_some_and(str::is_empty) {
        return Err(ApiError::validation("password cannot be empty"));
    }
    Ok(())
}

pub async fn share_guide(
    pool: &PgPool,
    guide_id: Uuid,
    owner: Uuid,
    web_base_url: &str,
    req: ShareRequest,
) -> ApiResult<ShareResponse> {
    require_owner(pool, guide_id, owner).await?;
    validate_share(&req, Utc::now())?;

    let password_hash = match req.password {
        Some(password) => Some(
            tokio::task::spawn_blocking(move || tokens::hash_password(&password)).await??,
        ),
        None => None,
    };

    let token = tokens::generate_opaque_token();
    sqlx::query(
        r#"
        INSERT INTO shared_links (guide_id, created_by, token, password_hash, expires_at, max_views)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(guide_id)
    .bind(owner)
    .bind(&token)
    .bind(password_hash)
    .bind(req.expires_at)
    .bind(req.max_views)
    .execute(pool)
    .await?;

    tracing::info!(guide_id = %guide_id, "Share link created");
    Ok(ShareResponse {
        share_url: share_url(web_base_url, &token),
        token,
        expires_at: req.expires_at,
        max_views: req.max_views,
    })
}

/// Why a link cannot be redeemed, checked in this order.
fn check_link(link: &SharedLink, now: DateTime<Utc>) -> ApiResult<()> {
    if link.is_expired(now) {
        return Err(ApiError::Forbidden {
            code: "LINK_EXPIRED",
            message: "This share link has expired".to_string(),
        });
    }
    if link.is_exhausted() {
        return Err(link_exhausted());
    }
    Ok(())
}

fn link_exhausted() -> ApiError {
    ApiError::Forbidden {
        code: "LINK_EXHAUSTED",
        message: "This share link has reached its view limit".to_string(),
    }
}

fn bad_share_password() -> ApiError {
    ApiError::unauthorized("INVALID_SHARE_PASSWORD", "Incorrect password for this share link")
}

/// Redeems a share token: validates it, spends one view and returns the
/// guide with its steps.
pub async fn redeem_shared(
    pool: &PgPool,
    token: &str,
    password: Option<String>,
) -> ApiResult<GuideWithSteps> {
    let link = sqlx::query_as::<_, SharedLink>(&format!(
        "SELECT {SHARED_LINK_COLUMNS} FROM shared_links WHERE token = $1"
    ))
    .bind(token)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("Share link not found"))?;

    check_link(&link, Utc::now())?;

    if let Some(phc) = link.password_hash.clone() {
        let Some(candidate) = password else {
            return Err(bad_share_password());
        };
        let matches =
            tokio::task::spawn_blocking(move || tokens::verify_password(&candidate, &phc)).await?;
        if !matches {
            return Err(bad_share_password());
        }
    }

    // The guard re-checks budget and expiry so concurrent redemptions
    // cannot overspend the link.
    let spent: Option<i32> = sqlx::query_scalar(
        r#"
        UPDATE shared_links SET view_count = view_count + 1
        WHERE id = $1
          AND (max_views IS NULL OR view_count < max_views)
          AND (expires_at IS NULL OR expires_at > NOW())
        RETURNING view_count
        "#,
    )
    .bind(link.id)
    .fetch_optional(pool)
    .await?;
    if spent.is_none() {
        return Err(link_exhausted());
    }

    let guide = fetch_guide(pool, link.guide_id).await?;
    let steps = load_steps(pool, link.guide_id).await?;
    Ok(GuideWithSteps { guide, steps })
}

// ============================================================================
// Collaborators
// ============================================================================

pub async fn list_collaborators(
    pool: &PgPool,
    guide_id: Uuid,
    user_id: Uuid,
) -> ApiResult<Vec<Collaborator>> {
    resolve_access(pool, guide_id, user_id).await?;

    let rows = sqlx::query_as::<_, Collaborator>(
        r#"
        SELECT gc.user_id, u.email, u.first_name, u.last_name, gc.role, gc.added_by, gc.added_at
        FROM guide_collaborators gc
        JOIN users u ON u.id = gc.user_id
        WHERE gc.guide_id = $1
        ORDER BY gc.added_at DESC
        "#,
    )
    .bind(guide_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCollaborator {
    pub email: Option<String>,
    pub role: Option<CollaboratorRole>,
}

/// Adds a collaborator, or changes the role of an existing one.
pub async fn add_collaborator(
    pool: &PgPool,
    guide_id: Uuid,
    owner: Uuid,
    req: AddCollaborator,
) -> ApiResult<Collaborator> {
    let email = req
        .email
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .ok_or_else(|| ApiError::validation("Email is required"))?;
    let role = req.role.unwrap_or(CollaboratorRole::Editor);

    require_owner(pool, guide_id, owner).await?;

    let user_id: Uuid =
        sqlx::query_scalar("SELECT id FROM users WHERE lower(email) = $1 AND is_active = TRUE")
            .bind(&email)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| ApiError::not_found("User not found"))?;

    if user_id == owner {
        return Err(ApiError::validation("The owner cannot be added as a collaborator"));
    }

    let collaborator = sqlx::query_as::<_, Collaborator>(
        r#"
        WITH up AS (
            INSERT INTO guide_collaborators (guide_id, user_id, role, added_by)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (guide_id, user_id) DO UPDATE SET role = EXCLUDED.role
            RETURNING user_id, role, added_by, added_at
        )
        SELECT up.user_id, u.email, u.first_name, u.last_name, up.role, up.added_by, up.added_at
        FROM up JOIN users u ON u.id = up.user_id
        "#,
    )
    .bind(guide_id)
    .bind(user_id)
    .bind(role.as_str())
    .bind(owner)
    .fetch_one(pool)
    .await?;

    tracing::info!(guide_id = %guide_id, collaborator = %user_id, role = %role, "Collaborator added");
    Ok(collaborator)
}

pub async fn remove_collaborator(
    pool: &PgPool,
    guide_id: Uuid,
    owner: Uuid,
    collaborator: Uuid,
) -> ApiResult<()> {
    require_owner(pool, guide_id, owner).await?;

    let removed = sqlx::query("DELETE FROM guide_collaborators WHERE guide_id = $1 AND user_id = $2")
        .bind(guide_id)
        .bind(collaborator)
        .execute(pool)
        .await?
        .rows_affected();
    if removed == 0 {
        return Err(ApiError::not_found("Collaborator not found"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn link(expires_at: Option<DateTime<Utc>>, max_views: Option<i32>, view_count: i32) -> SharedLink {
        SharedLink {
            id: Uuid::new_v4(),
            guide_id: Uuid::new_v4(),
            created_by: Uuid::new_v4(),
            token: "tok".to_string(),
            password_hash: None,
            expires_at,
            max_views,
            view_count,
            created_at: Utc::now(),
        }
    }

    fn code(e: ApiError) -> &'static str {
        e.classify().1
    }

    #[test]
    fn test_share_url_trims_slash() {
        assert_eq!(
            share_url("https://app.example.com/", "abc"),
            "https://app.example.com/shared/abc"
        );
    }

    #[test]
    fn test_expired_checked_before_exhausted() {
        let now = Utc::now();
        let l = link(Some(now - Duration::minutes(1)), Some(1), 1);
        assert_eq!(code(check_link(&l, now).unwrap_err()), "LINK_EXPIRED");

        let l = link(Some(now + Duration::minutes(1)), Some(1), 1);
        assert_eq!(code(check_link(&l, now).unwrap_err()), "LINK_EXHAUSTED");

        assert!(check_link(&link(None, Some(2), 1), now).is_ok());
    }

    #[test]
    fn test_share_request_validation() {
        let now = Utc::now();
        let past = ShareRequest {
            expires_at: Some(now - Duration::seconds(1)),
            ..Default::default()
        };
        assert!(validate_share(&past, now).is_err());

        let zero = ShareRequest {
            max_views: Some(0),
            ..Default::default()
        };
        assert!(validate_share(&zero, now).is_err());

        let ok = ShareRequest {
            password: Some("hunter2".into()),
            expires_at: Some(now + Duration::days(1)),
            max_views: Some(5),
        };
        assert!(validate_share(&ok, now).is_ok());
    }

    #[test]
    fn test_bad_password_is_401() {
        let (status, code, _) = bad_share_password().classify();
        assert_eq!(status.as_u16(), 401);
        assert_eq!(code, "INVALID_SHARE_PASSWORD");
    }
}
