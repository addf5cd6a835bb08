//! `/guides` endpoints and shared-link redemption.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use bytes::Bytes;
use processmaster_core::ObjectStore;
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use super::extract::{JsonBody, PathParams, QueryParams};
use super::{created, ok, AppState, Reply};
use crate::error::{ApiError, ApiResult};
use crate::subsystems::auth::AuthUser;
use crate::subsystems::export::{self, ExportFormat, ExportOutcome};
use crate::subsystems::guides::{self, CreateGuide, ListGuides, UpdateGuide};
use crate::subsystems::sharing::{self, AddCollaborator, ShareRequest};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_handler).post(create_handler))
        .route(
            "/:id",
            get(get_handler).put(update_handler).delete(delete_handler),
        )
        .route("/:id/share", post(share_handler))
        .route(
            "/:id/collaborators",
            get(list_collaborators_handler).post(add_collaborator_handler),
        )
        .route(
            "/:id/collaborators/:user_id",
            delete(remove_collaborator_handler),
        )
        .route("/:id/export/:format", get(export_handler))
}

#[derive(Debug, Default, Deserialize)]
pub struct RedeemRequest {
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub upload: bool,
}

/// An empty body means no password.
pub fn parse_redeem_body(body: &[u8]) -> ApiResult<RedeemRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RedeemRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::validation(format!("Invalid JSON body: {}", e)))
}

// ============================================================================
// Inner functions
// ============================================================================

pub async fn list_inner(pool: &PgPool, user: &AuthUser, query: &ListGuides) -> Reply {
    ok(guides::list_guides(pool, user.id, query).await?)
}

pub async fn create_inner(pool: &PgPool, user: &AuthUser, req: CreateGuide) -> Reply {
    created(guides::create_guide(pool, user.id, req).await?)
}

pub async fn get_inner(pool: &PgPool, user: &AuthUser, guide_id: Uuid) -> Reply {
    ok(guides::get_guide(pool, guide_id, user.id).await?)
}

pub async fn update_inner(pool: &PgPool, user: &AuthUser, guide_id: Uuid, req: &UpdateGuide) -> Reply {
    ok(guides::update_guide(pool, guide_id, user.id, req).await?)
}

pub async fn delete_inner(pool: &PgPool, user: &AuthUser, guide_id: Uuid) -> Reply {
    guides::delete_guide(pool, guide_id, user).await?;
    ok(serde_json::json!({ "message": "Guide deleted successfully" }))
}

pub async fn share_inner(
    pool: &PgPool,
    web_base_url: &str,
    user: &AuthUser,
    guide_id: Uuid,
    req: ShareRequest,
) -> Reply {
    created(sharing::share_guide(pool, guide_id, user.id, web_base_url, req).await?)
}

pub async fn redeem_inner(pool: &PgPool, token: &str, req: RedeemRequest) -> Reply {
    ok(sharing::redeem_shared(pool, token, req.password).await?)
}

pub async fn list_collaborators_inner(pool: &PgPool, user: &AuthUser, guide_id: Uuid) -> Reply {
    ok(sharing::list_collaborators(pool, guide_id, user.id).await?)
}

pub async fn add_collaborator_inner(
    pool: &PgPool,
    user: &AuthUser,
    guide_id: Uuid,
    req: AddCollaborator,
) -> Reply {
    created(sharing::add_collaborator(pool, guide_id, user.id, req).await?)
}

pub async fn remove_collaborator_inner(
    pool: &PgPool,
    user: &AuthUser,
    guide_id: Uuid,
    collaborator: Uuid,
) -> Reply {
    sharing::remove_collaborator(pool, guide_id, user.id, collaborator).await?;
    ok(serde_json::json!({ "message": "Collaborator removed successfully" }))
}

pub async fn export_inner(
    pool: &PgPool,
    store: &dyn ObjectStore,
    user: &AuthUser,
    guide_id: Uuid,
    format: &str,
    upload: bool,
) -> ApiResult<ExportOutcome> {
    let format = ExportFormat::parse(format)?;
    export::export_guide(pool, store, guide_id, user.id, format, upload).await
}

/// Inline exports are sent as a file download; uploads as an enveloped URL.
pub fn export_response(outcome: ExportOutcome) -> Response {
    match outcome {
        ExportOutcome::Inline {
            filename,
            content_type,
            body,
        } => (
            StatusCode::OK,
            [
                (CONTENT_TYPE, content_type.to_string()),
                (
                    CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", filename),
                ),
            ],
            body,
        )
            .into_response(),
        uploaded @ ExportOutcome::Uploaded { .. } => ok(uploaded).into_response(),
    }
}

// ============================================================================
// Axum handler wrappers
// ============================================================================

pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    QueryParams(query): QueryParams<ListGuides>,
) -> Reply {
    list_inner(&state.pool, &user, &query).await
}

pub async fn create_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    JsonBody(req): JsonBody<CreateGuide>,
) -> Reply {
    create_inner(&state.pool, &user, req).await
}

pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams(id): PathParams<Uuid>,
) -> Reply {
    get_inner(&state.pool, &user, id).await
}

pub async fn update_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams(id): PathParams<Uuid>,
    JsonBody(req): JsonBody<UpdateGuide>,
) -> Reply {
    update_inner(&state.pool, &user, id, &req).await
}

pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams(id): PathParams<Uuid>,
) -> Reply {
    delete_inner(&state.pool, &user, id).await
}

pub async fn share_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams(id): PathParams<Uuid>,
    JsonBody(req): JsonBody<ShareRequest>,
) -> Reply {
    share_inner(&state.pool, &state.config.auth.web_base_url, &user, id, req).await
}

pub async fn redeem_shared_handler(
    State(state): State<Arc<AppState>>,
    PathParams(token): PathParams<String>,
    body: Bytes,
) -> Reply {
    let req = parse_redeem_body(&body)?;
    redeem_inner(&state.pool, &token, req).await
}

pub async fn list_collaborators_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams(id): PathParams<Uuid>,
) -> Reply {
    list_collaborators_inner(&state.pool, &user, id).await
}

pub async fn add_collaborator_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams(id): PathParams<Uuid>,
    JsonBody(req): JsonBody<AddCollaborator>,
) -> Reply {
    add_collaborator_inner(&state.pool, &user, id, req).await
}

pub async fn remove_collaborator_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams((id, collaborator)): PathParams<(Uuid, Uuid)>,
) -> Reply {
    remove_collaborator_inner(&state.pool, &user, id, collaborator).await
}

pub async fn export_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams((id, format)): PathParams<(Uuid, String)>,
    QueryParams(query): QueryParams<ExportQuery>,
) -> Response {
    match export_inner(&state.pool, state.store.as_ref(), &user, id, &format, query.upload).await {
        Ok(outcome) => export_response(outcome),
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::{make_state, make_user};
    use axum::body::to_bytes;
    use axum::Json;
    use processmaster_core::models::{CollaboratorRole, Role, Visibility};

    #[test]
    fn test_redeem_body_parsing() {
        assert!(parse_redeem_body(b"").unwrap().password.is_none());
        assert!(parse_redeem_body(b"  \n").unwrap().password.is_none());
        assert_eq!(
            parse_redeem_body(br#"{"password":"hunter2"}"#)
                .unwrap()
                .password
                .as_deref(),
            Some("hunter2")
        );
        assert!(parse_redeem_body(b"{nope").is_err());
    }

    #[tokio::test]
    async fn test_inline_export_is_attachment() {
        let resp = export_response(ExportOutcome::Inline {
            filename: "guide-1.md".into(),
            content_type: "text/markdown; charset=utf-8",
            body: "# Title".into(),
        });
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[CONTENT_DISPOSITION],
            "attachment; filename=\"guide-1.md\""
        );
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"# Title");
    }

    async fn new_guide(pool: &PgPool, owner: &AuthUser, visibility: Visibility) -> Uuid {
        let (_, Json(body)) = create_inner(
            pool,
            owner,
            CreateGuide {
                title: Some("Submit an expense".into()),
                description: Some("From receipt to approval".into()),
                visibility: Some(visibility),
                tags: Some(vec!["finance".into()]),
                ..CreateGuide::default()
            },
        )
        .await
        .unwrap();
        serde_json::from_value(body["data"]["id"].clone()).unwrap()
    }

    #[tokio::test]
    async fn test_create_requires_title_and_description() {
        let state = match make_state().await {
            Some(s) => s,
            None => {
                eprintln!("Skipping test_create_requires_title_and_description: DB unavailable");
                return;
            }
        };
        let (_, user) = make_user(&state, Role::User).await;
        let err = create_inner(
            &state.pool,
            &user,
            CreateGuide {
                title: Some("Only a title".into()),
                ..CreateGuide::default()
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.classify().0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_version_and_view_count() {
        let state = match make_state().await {
            Some(s) => s,
            None => {
                eprintln!("Skipping test_version_and_view_count: DB unavailable");
                return;
            }
        };
        let (_, owner) = make_user(&state, Role::User).await;
        let (_, reader) = make_user(&state, Role::User).await;
        let id = new_guide(&state.pool, &owner, Visibility::Public).await;

        for n in 0..3 {
            let req = UpdateGuide {
                description: Some(format!("revision {}", n)),
                ..UpdateGuide::default()
            };
            update_inner(&state.pool, &owner, id, &req).await.unwrap();
        }

        // Owner reads do not count.
        let (_, Json(body)) = get_inner(&state.pool, &owner, id).await.unwrap();
        assert_eq!(body["data"]["version"], 4);
        assert_eq!(body["data"]["viewCount"], 0);

        get_inner(&state.pool, &reader, id).await.unwrap();
        let (_, Json(body)) = get_inner(&state.pool, &reader, id).await.unwrap();
        assert_eq!(body["data"]["viewCount"], 2);

        let stale = UpdateGuide {
            title: Some("Stale".into()),
            expected_version: Some(1),
            ..UpdateGuide::default()
        };
        let err = update_inner(&state.pool, &owner, id, &stale).await.unwrap_err();
        assert_eq!(err.classify().1, "VERSION_CONFLICT");

        let err = update_inner(&state.pool, &reader, id, &UpdateGuide::default())
            .await
            .unwrap_err();
        assert_eq!(err.classify().0, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_private_guide_hidden_until_collaborator_added() {
        let state = match make_state().await {
            Some(s) => s,
            None => {
                eprintln!("Skipping test_private_guide_hidden_until_collaborator_added: DB unavailable");
                return;
            }
        };
        let (_, owner) = make_user(&state, Role::User).await;
        let (_, editor) = make_user(&state, Role::User).await;
        let id = new_guide(&state.pool, &owner, Visibility::Private).await;

        let err = get_inner(&state.pool, &editor, id).await.unwrap_err();
        assert_eq!(err.classify().0, StatusCode::NOT_FOUND);

        add_collaborator_inner(
            &state.pool,
            &owner,
            id,
            AddCollaborator {
                email: Some(editor.email.to_uppercase()),
                role: Some(CollaboratorRole::Editor),
            },
        )
        .await
        .unwrap();

        let req = UpdateGuide {
            title: Some("Edited by collaborator".into()),
            ..UpdateGuide::default()
        };
        let (_, Json(body)) = update_inner(&state.pool, &editor, id, &req).await.unwrap();
        assert_eq!(body["data"]["title"], "Edited by collaborator");

        let (_, Json(list)) = list_collaborators_inner(&state.pool, &owner, id).await.unwrap();
        assert_eq!(list["data"].as_array().unwrap().len(), 1);

        remove_collaborator_inner(&state.pool, &owner, id, editor.id)
            .await
            .unwrap();
        let err = get_inner(&state.pool, &editor, id).await.unwrap_err();
        assert_eq!(err.classify().0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_share_and_redeem_with_view_budget() {
        let state = match make_state().await {
            Some(s) => s,
            None => {
                eprintln!("Skipping test_share_and_redeem_with_view_budget: DB unavailable");
                return;
            }
        };
        let (_, owner) = make_user(&state, Role::User).await;
        let id = new_guide(&state.pool, &owner, Visibility::Private).await;

        let (status, Json(body)) = share_inner(
            &state.pool,
            "https://app.example.com",
            &owner,
            id,
            ShareRequest {
                password: Some("open sesame".into()),
                max_views: Some(1),
                ..ShareRequest::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        let token = body["data"]["token"].as_str().unwrap().to_string();
        assert!(body["data"]["shareUrl"]
            .as_str()
            .unwrap()
            .ends_with(&format!("/shared/{}", token)));

        let err = redeem_inner(&state.pool, &token, RedeemRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.classify().1, "INVALID_SHARE_PASSWORD");

        let good = RedeemRequest {
            password: Some("open sesame".into()),
        };
        let (_, Json(guide)) = redeem_inner(&state.pool, &token, good).await.unwrap();
        assert_eq!(guide["data"]["title"], "Submit an expense");

        let again = RedeemRequest {
            password: Some("open sesame".into()),
        };
        let err = redeem_inner(&state.pool, &token, again).await.unwrap_err();
        assert_eq!(err.classify().1, "LINK_EXHAUSTED");

        let err = redeem_inner(&state.pool, "no-such-token", RedeemRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.classify().0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_export_formats() {
        let state = match make_state().await {
            Some(s) => s,
            None => {
                eprintln!("Skipping test_export_formats: DB unavailable");
                return;
            }
        };
        let (_, owner) = make_user(&state, Role::User).await;
        let id = new_guide(&state.pool, &owner, Visibility::Private).await;

        let err = export_inner(&state.pool, state.store.as_ref(), &owner, id, "pdf", false)
            .await
            .unwrap_err();
        assert_eq!(err.classify().1, "UNSUPPORTED_FORMAT");

        match export_inner(&state.pool, state.store.as_ref(), &owner, id, "md", false)
            .await
            .unwrap()
        {
            ExportOutcome::Inline { body, .. } => assert!(body.contains("Submit an expense")),
            other => panic!("expected inline export, got {:?}", other),
        }

        match export_inner(&state.pool, state.store.as_ref(), &owner, id, "html", true)
            .await
            .unwrap()
        {
            ExportOutcome::Uploaded { key, .. } => {
                assert!(key.starts_with("exports/"));
                assert!(state.store.head(&key).await.unwrap().is_some());
            }
            other => panic!("expected uploaded export, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_requires_owner_or_admin() {
        let state = match make_state().await {
            Some(s) => s,
            None => {
                eprintln!("Skipping test_delete_requires_owner_or_admin: DB unavailable");
                return;
            }
        };
        let (_, owner) = make_user(&state, Role::User).await;
        let (_, stranger) = make_user(&state, Role::User).await;
        let (_, admin) = make_user(&state, Role::Admin).await;
        let id = new_guide(&state.pool, &owner, Visibility::Public).await;

        let err = delete_inner(&state.pool, &stranger, id).await.unwrap_err();
        assert_eq!(err.classify().0, StatusCode::FORBIDDEN);

        delete_inner(&state.pool, &admin, id).await.unwrap();
        let err = get_inner(&state.pool, &owner, id).await.unwrap_err();
        assert_eq!(err.classify().0, StatusCode::NOT_FOUND);
    }
}
