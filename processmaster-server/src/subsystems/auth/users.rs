//! User and refresh-token persistence.

use chrono::{Duration, Utc};
use processmaster_core::models::user::USER_COLUMNS;
use processmaster_core::models::{AuthProvider, Role, User};
use sqlx::PgPool;
use uuid::Uuid;

use super::VerifiedIdentity;

pub async fn find_by_email(pool: &PgPool, email: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
    ))
    .bind(email.trim().to_lowercase())
    .fetch_optional(pool)
    .await
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub struct NewUser<'a> {
    pub email: &'a str,
    pub first_name: Option<&'a str>,
    pub last_name: Option<&'a str>,
    pub password_hash: Option<&'a str>,
    pub provider: AuthProvider,
    pub provider_id: Option<&'a str>,
    pub role: Role,
}

pub async fn create_user(pool: &PgPool, new: NewUser<'_>) -> Result<User, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        r#"
        INSERT INTO users (email, first_name, last_name, password_hash, provider, provider_id, role)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {USER_COLUMNS}
        "#
    ))
    .bind(new.email.trim().to_lowercase())
    .bind(new.first_name)
    .bind(new.last_name)
    .bind(new.password_hash)
    .bind(new.provider.as_str())
    .bind(new.provider_id)
    .bind(new.role.as_str())
    .fetch_one(pool)
    .await
}

/// Get-or-create for directory and OAuth2 identities. Existing users keep
/// their stored role; `last_login` is stamped either way.
pub async fn provision(pool: &PgPool, identity: &VerifiedIdentity) -> Result<User, sqlx::Error> {
    let user = sqlx::query_as::<_, User>(&format!(
        r#"
        INSERT INTO users (email, first_name, last_name, provider, provider_id, role, last_login)
        VALUES ($1, $2, $3, $4, $5, $6, NOW())
        ON CONFLICT (email) DO UPDATE SET last_login = NOW()
        RETURNING {USER_COLUMNS}
        "#
    ))
    .bind(identity.email.trim().to_lowercase())
    .bind(identity.first_name.as_deref())
    .bind(identity.last_name.as_deref())
    .bind(identity.provider.as_str())
    .bind(identity.provider_id.as_deref())
    .bind(identity.role.unwrap_or(Role::User).as_str())
    .fetch_one(pool)
    .await?;

    tracing::info!(user_id = %user.id, provider = %identity.provider, "User provisioned");
    Ok(user)
}

pub async fn touch_last_login(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET last_login = NOW() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Store a refresh token hash and purge the user's expired ones.
pub async fn save_refresh_token(
    pool: &PgPool,
    user_id: Uuid,
    token_hash: &str,
    ttl_secs: u64,
) -> Result<(), sqlx::Error> {
    let expires_at = Utc::now() + Duration::seconds(ttl_secs as i64);
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1 AND expires_at <= NOW()")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("INSERT INTO refresh_tokens (user_id, token_hash, expires_at) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

    tx.commit().await
}

/// The active user owning an unexpired refresh token hash.
pub async fn user_for_refresh_token(
    pool: &PgPool,
    token_hash: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        r#"
        SELECT {cols}
        FROM users u
        JOIN refresh_tokens rt ON rt.user_id = u.id
        WHERE rt.token_hash = $1 AND rt.expires_at > NOW() AND u.is_active
        "#,
        cols = USER_COLUMNS
            .split(", ")
            .map(|c| format!("u.{}", c))
            .collect::<Vec<_>>()
            .join(", ")
    ))
    .bind(token_hash)
    .fetch_optional(pool)
    .await
}

pub async fn revoke_refresh_token(pool: &PgPool, token_hash: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM refresh_tokens WHERE token_hash = $1")
        .bind(token_hash)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
