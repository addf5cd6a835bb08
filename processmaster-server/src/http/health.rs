//! `GET /health` and `GET /version`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use processmaster_core::envelope;
use sqlx::PgPool;

use super::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
}

/// Queries the DB; 503 when it is unreachable.
pub async fn health_inner(pool: &PgPool) -> (StatusCode, serde_json::Value) {
    match processmaster_core::db::health_check(pool).await {
        Ok(pg_ver) => (
            StatusCode::OK,
            envelope(serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "postgresql": pg_ver,
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "success": false,
                    "error": {
                        "code": "SERVICE_UNAVAILABLE",
                        "message": "Database unavailable",
                    },
                }),
            )
        }
    }
}

pub fn version_inner() -> serde_json::Value {
    envelope(serde_json::json!({
        "name": "processmaster",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.pool).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::make_state;

    #[test]
    fn test_version_inner_pure() {
        let v = version_inner();
        assert_eq!(v["success"], true);
        assert_eq!(v["data"]["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_health_inner_ok() {
        let state = match make_state().await {
            Some(s) => s,
            None => {
                eprintln!("Skipping test_health_inner_ok: DB unavailable");
                return;
            }
        };

        let (status, body) = health_inner(&state.pool).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "healthy");
        assert!(body["data"]["postgresql"].is_string());
    }
}
