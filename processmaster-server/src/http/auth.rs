//! `/auth` endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use processmaster_core::models::AuthProvider;
use serde::Deserialize;

use super::extract::{JsonBody, QueryParams};
use super::{ok, AppState, Reply};
use crate::error::{ApiError, ApiResult};
use crate::subsystems::auth::{AuthGateway, AuthUser};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/login", post(login_handler))
        .route("/refresh", post(refresh_handler))
        .route("/logout", post(logout_handler))
        .route("/me", get(me_handler))
        .route("/oauth2/authorize", get(oauth2_authorize_handler))
        .route("/oauth2/callback", get(oauth2_callback_handler))
        .route("/ldap/login", post(ldap_login_handler))
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub provider: Option<AuthProvider>,
}

#[derive(Debug, Deserialize)]
pub struct LdapLoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

// ============================================================================
// Inner functions
// ============================================================================

pub async fn login_inner(auth: &AuthGateway, req: LoginRequest) -> Reply {
    if req.email.trim().is_empty() || req.password.is_empty() {
        return Err(ApiError::validation("Email and password are required"));
    }
    let provider = req.provider.unwrap_or(AuthProvider::Local);
    let session = auth.login(req.email.trim(), &req.password, provider).await?;
    ok(session)
}

pub async fn ldap_login_inner(auth: &AuthGateway, req: LdapLoginRequest) -> Reply {
    if req.username.trim().is_empty() || req.password.is_empty() {
        return Err(ApiError::validation("Username and password are required"));
    }
    let session = auth
        .login(req.username.trim(), &req.password, AuthProvider::Ldap)
        .await?;
    ok(session)
}

fn require_refresh_token(req: RefreshRequest) -> ApiResult<String> {
    req.refresh_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::validation("Refresh token is required"))
}

pub async fn refresh_inner(auth: &AuthGateway, req: RefreshRequest) -> Reply {
    let refresh_token = require_refresh_token(req)?;
    let token = auth.refresh(&refresh_token).await?;
    ok(serde_json::json!({ "token": token }))
}

pub async fn logout_inner(auth: &AuthGateway, req: RefreshRequest) -> Reply {
    let refresh_token = require_refresh_token(req)?;
    auth.logout(&refresh_token).await?;
    ok(serde_json::json!({ "message": "Logged out successfully" }))
}

pub async fn me_inner(auth: &AuthGateway, user: &AuthUser) -> Reply {
    ok(auth.profile(user.id).await?)
}

pub async fn oauth2_callback_inner(auth: &AuthGateway, query: CallbackQuery) -> ApiResult<String> {
    if let Some(error) = query.error {
        return Err(ApiError::unauthorized("OAUTH2_DENIED", error));
    }
    let (Some(code), Some(state)) = (query.code, query.state) else {
        return Err(ApiError::validation("Authorization code and state are required"));
    };
    Ok(auth.oauth2_callback(&code, &state).await?)
}

// ============================================================================
// Axum handler wrappers
// ============================================================================

pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    JsonBody(req): JsonBody<LoginRequest>,
) -> Reply {
    login_inner(&state.auth, req).await
}

pub async fn ldap_login_handler(
    State(state): State<Arc<AppState>>,
    JsonBody(req): JsonBody<LdapLoginRequest>,
) -> Reply {
    ldap_login_inner(&state.auth, req).await
}

pub async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    JsonBody(req): JsonBody<RefreshRequest>,
) -> Reply {
    refresh_inner(&state.auth, req).await
}

pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    JsonBody(req): JsonBody<RefreshRequest>,
) -> Reply {
    logout_inner(&state.auth, req).await
}

pub async fn me_handler(State(state): State<Arc<AppState>>, user: AuthUser) -> Reply {
    me_inner(&state.auth, &user).await
}

pub async fn oauth2_authorize_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.auth.oauth2_authorize_url() {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

pub async fn oauth2_callback_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(query): QueryParams<CallbackQuery>,
) -> Response {
    match oauth2_callback_inner(&state.auth, query).await {
        Ok(location) => Redirect::to(&location).into_response(),
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::{make_state, make_user};
    use axum::http::StatusCode;
    use processmaster_core::models::Role;

    #[test]
    fn test_login_request_provider_tag() {
        let req: LoginRequest =
            serde_json::from_str(r#"{"email":"a@b.c","password":"x","provider":"ldap"}"#).unwrap();
        assert_eq!(req.provider, Some(AuthProvider::Ldap));

        let bad = serde_json::from_str::<LoginRequest>(
            r#"{"email":"a@b.c","password":"x","provider":"kerberos"}"#,
        );
        assert!(bad.is_err());
    }

    #[tokio::test]
    async fn test_login_requires_fields() {
        let state = match make_state().await {
            Some(s) => s,
            None => {
                eprintln!("Skipping test_login_requires_fields: DB unavailable");
                return;
            }
        };
        let err = login_inner(
            &state.auth,
            LoginRequest {
                email: " ".into(),
                password: "x".into(),
                provider: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.classify().0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_login_refresh_logout_cycle() {
        let state = match make_state().await {
            Some(s) => s,
            None => {
                eprintln!("Skipping test_login_refresh_logout_cycle: DB unavailable");
                return;
            }
        };
        let (user, _) = make_user(&state, Role::User).await;

        let (status, body) = login_inner(
            &state.auth,
            LoginRequest {
                email: user.email.clone(),
                password: "correct horse battery".into(),
                provider: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::OK);
        let refresh_token = body.0["data"]["refreshToken"].as_str().unwrap().to_string();
        assert!(body.0["data"]["token"].is_string());

        let (_, refreshed) = refresh_inner(
            &state.auth,
            RefreshRequest {
                refresh_token: Some(refresh_token.clone()),
            },
        )
        .await
        .unwrap();
        let token = refreshed.0["data"]["token"].as_str().unwrap();
        let me = state.auth.authenticate_bearer(token).unwrap();
        assert_eq!(me.id, user.id);

        logout_inner(
            &state.auth,
            RefreshRequest {
                refresh_token: Some(refresh_token.clone()),
            },
        )
        .await
        .unwrap();

        let err = refresh_inner(
            &state.auth,
            RefreshRequest {
                refresh_token: Some(refresh_token),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.classify().0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_wrong_password_is_unauthorized() {
        let state = match make_state().await {
            Some(s) => s,
            None => {
                eprintln!("Skipping test_wrong_password_is_unauthorized: DB unavailable");
                return;
            }
        };
        let (user, _) = make_user(&state, Role::User).await;
        let err = login_inner(
            &state.auth,
            LoginRequest {
                email: user.email,
                password: "nope".into(),
                provider: Some(AuthProvider::Local),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.classify().0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_callback_without_code_is_rejected() {
        let state = match make_state().await {
            Some(s) => s,
            None => {
                eprintln!("Skipping test_callback_without_code_is_rejected: DB unavailable");
                return;
            }
        };
        let err = oauth2_callback_inner(
            &state.auth,
            CallbackQuery {
                code: None,
                state: Some("s".into()),
                error: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.classify().0, StatusCode::BAD_REQUEST);

        let denied = oauth2_callback_inner(
            &state.auth,
            CallbackQuery {
                code: None,
                state: None,
                error: Some("access_denied".into()),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(denied.classify().1, "OAUTH2_DENIED");
    }
}
