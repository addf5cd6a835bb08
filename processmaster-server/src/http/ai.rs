//! `/ai` endpoints: single-shot analysis, queued generation and batch jobs,
//! synchronous text operations, job control.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Multipart, State};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::{self, StreamExt};
use processmaster_core::models::{Job, JobType};
use processmaster_core::VisionBackend;
use sqlx::PgPool;
use uuid::Uuid;

use super::extract::{JsonBody, PathParams};
use super::multipart::{MultipartForm, UploadedFile};
use super::{ok, AppState, Reply};
use crate::error::{ApiError, ApiResult};
use crate::subsystems::auth::AuthUser;
use crate::subsystems::content::{self, EnhanceRequest, OptimizeRequest, TranslateRequest};
use crate::subsystems::jobs::{result_view, status_view, JobQueue, NewJob};
use crate::subsystems::synthesis::{is_remote_source, BatchInput, GenerateInput};
use crate::subsystems::uploads::require_key_owner;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/analyze", post(analyze_handler))
        .route("/generate", post(generate_handler))
        .route("/enhance", post(enhance_handler))
        .route("/optimize", post(optimize_handler))
        .route("/translate", post(translate_handler))
        .route("/models", get(models_handler))
        .route("/models/test", post(test_model_handler))
        .route("/batch/analyze", post(batch_analyze_handler))
        .route("/batch/:job_id/status", get(batch_status_handler))
        .route("/batch/:job_id/result", get(batch_result_handler))
        .route("/jobs/:job_id/cancel", post(cancel_handler))
}

/// Seconds quoted to the client per queued batch image.
const BATCH_SECONDS_PER_IMAGE: usize = 2;

fn check_image_count(count: usize, max: usize, what: &str) -> ApiResult<()> {
    if count == 0 {
        return Err(ApiError::validation(format!("No {} provided", what)));
    }
    if count > max {
        return Err(ApiError::validation(format!(
            "Maximum {} {} allowed per request",
            max, what
        )));
    }
    Ok(())
}

fn media_type_of(file: &UploadedFile) -> String {
    file.content_type
        .clone()
        .filter(|c| c.starts_with("image/"))
        .or_else(|| {
            file.filename
                .as_deref()
                .and_then(|name| mime_guess::from_path(name).first())
                .map(|m| m.essence_str().to_string())
        })
        .unwrap_or_else(|| "image/png".to_string())
}

// ============================================================================
// Inner functions
// ============================================================================

async fn analyze_file(
    vision: &dyn VisionBackend,
    file: UploadedFile,
    context: Option<String>,
) -> serde_json::Value {
    let filename = file.filename.clone().unwrap_or_default();
    match vision
        .analyze_screenshot(&file.bytes, &media_type_of(&file), context.as_deref())
        .await
    {
        Ok(analysis) => serde_json::json!({
            "filename": filename,
            "confidence": analysis.confidence,
            "analysis": analysis,
        }),
        Err(e) => {
            tracing::warn!(file = %filename, error = %e, "Image analysis failed");
            serde_json::json!({
                "filename": filename,
                "error": "Analysis failed",
                "confidence": 0,
            })
        }
    }
}

/// Analyze uploaded images now. A failed image is reported inline and does
/// not fail the request.
pub async fn analyze_inner(
    vision: &dyn VisionBackend,
    concurrency: usize,
    max_images: usize,
    mut form: MultipartForm,
) -> Reply {
    let files = form.take_files("images");
    let total = files.len();
    check_image_count(total, max_images, "images")?;
    let context = form.field("context").map(str::to_string);

    let analyses: Vec<serde_json::Value> = stream::iter(files)
        .map(move |file| analyze_file(vision, file, context.clone()))
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let successful = analyses.iter().filter(|a| a.get("analysis").is_some()).count();
    ok(serde_json::json!({
        "analyses": analyses,
        "totalImages": total,
        "successfulAnalyses": successful,
    }))
}

/// Object-store keys must belong to the caller; remote URLs pass through.
async fn require_owned_sources(pool: &PgPool, user: &AuthUser, sources: &[String]) -> ApiResult<()> {
    for source in sources.iter().filter(|s| !is_remote_source(s)) {
        require_key_owner(pool, source, user).await?;
    }
    Ok(())
}

pub async fn generate_inner(
    pool: &PgPool,
    jobs: &JobQueue,
    user: &AuthUser,
    input: GenerateInput,
) -> Reply {
    check_image_count(
        input.screenshots.len(),
        jobs.config().max_batch_images,
        "screenshots",
    )?;
    require_owned_sources(pool, user, &input.screenshots).await?;
    let job = jobs
        .enqueue(NewJob {
            user_id: user.id,
            capture_session_id: None,
            job_type: JobType::Generate,
            input_data: serde_json::to_value(&input)
                .map_err(|e| ApiError::internal(e.to_string()))?,
        })
        .await?;

    ok(serde_json::json!({
        "jobId": job.id,
        "status": "processing",
        "message": "Instruction generation started",
    }))
}

pub async fn batch_analyze_inner(
    pool: &PgPool,
    jobs: &JobQueue,
    user: &AuthUser,
    input: BatchInput,
) -> Reply {
    let count = input.image_urls.len();
    check_image_count(count, jobs.config().max_batch_images, "images")?;
    require_owned_sources(pool, user, &input.image_urls).await?;
    let job = jobs
        .enqueue(NewJob {
            user_id: user.id,
            capture_session_id: None,
            job_type: JobType::BatchAnalyze,
            input_data: serde_json::to_value(&input)
                .map_err(|e| ApiError::internal(e.to_string()))?,
        })
        .await?;

    ok(serde_json::json!({
        "jobId": job.id,
        "status": "processing",
        "imageCount": count,
        "estimatedTime": format!("{} seconds", count * BATCH_SECONDS_PER_IMAGE),
    }))
}

pub fn models_inner(vision: &dyn VisionBackend) -> Reply {
    let model = vision.model();
    ok(serde_json::json!({
        "models": [{
            "id": model,
            "provider": "anthropic",
            "capabilities": ["vision", "text"],
        }],
        "defaultModel": model,
    }))
}

const MODEL_TEST_PROMPT: &str = "Respond with \"Model test successful\" if you can process this request.";

/// One small round trip to the configured model. Failures are reported in
/// the payload rather than as an error status.
pub async fn test_model_inner(vision: &dyn VisionBackend) -> Reply {
    let started = Instant::now();
    let result = vision.enhance_content(MODEL_TEST_PROMPT, "technical").await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(response) => ok(serde_json::json!({
            "success": true,
            "modelId": vision.model(),
            "latencyMs": latency_ms,
            "response": response,
        })),
        Err(e) => {
            tracing::warn!(model = vision.model(), error = %e, "Model test failed");
            ok(serde_json::json!({
                "success": false,
                "modelId": vision.model(),
                "latencyMs": latency_ms,
                "error": e.to_string(),
            }))
        }
    }
}

pub async fn batch_status_inner(jobs: &JobQueue, user: &AuthUser, job_id: Uuid) -> Reply {
    let job = jobs.get(job_id, user.id).await?;
    ok(status_view(&job))
}

pub async fn batch_result_inner(jobs: &JobQueue, user: &AuthUser, job_id: Uuid) -> Reply {
    let job = jobs.get(job_id, user.id).await?;
    ok(result_view(&job)?)
}

pub async fn cancel_inner(jobs: &JobQueue, user: &AuthUser, job_id: Uuid) -> Reply {
    let job: Job = jobs.cancel(job_id, user.id).await?;
    ok(status_view(&job))
}

// ============================================================================
// Axum handler wrappers
// ============================================================================

pub async fn analyze_handler(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    multipart: Multipart,
) -> Reply {
    let form = MultipartForm::read(multipart).await?;
    analyze_inner(
        state.vision.as_ref(),
        state.config.vision.concurrency,
        state.config.jobs.max_batch_images,
        form,
    )
    .await
}

pub async fn generate_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    JsonBody(input): JsonBody<GenerateInput>,
) -> Reply {
    generate_inner(&state.pool, &state.jobs, &user, input).await
}

pub async fn enhance_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    JsonBody(req): JsonBody<EnhanceRequest>,
) -> Reply {
    ok(content::enhance(state.vision.as_ref(), &state.jobs, user.id, req).await?)
}

pub async fn optimize_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    JsonBody(req): JsonBody<OptimizeRequest>,
) -> Reply {
    ok(content::optimize(state.vision.as_ref(), &state.jobs, user.id, req).await?)
}

pub async fn translate_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    JsonBody(req): JsonBody<TranslateRequest>,
) -> Reply {
    ok(content::translate(state.vision.as_ref(), &state.jobs, user.id, req).await?)
}

pub async fn models_handler(State(state): State<Arc<AppState>>, _user: AuthUser) -> Reply {
    models_inner(state.vision.as_ref())
}

pub async fn test_model_handler(State(state): State<Arc<AppState>>, _user: AuthUser) -> Reply {
    test_model_inner(state.vision.as_ref()).await
}

pub async fn batch_analyze_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    JsonBody(input): JsonBody<BatchInput>,
) -> Reply {
    batch_analyze_inner(&state.pool, &state.jobs, &user, input).await
}

pub async fn batch_status_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams(job_id): PathParams<Uuid>,
) -> Reply {
    batch_status_inner(&state.jobs, &user, job_id).await
}

pub async fn batch_result_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams(job_id): PathParams<Uuid>,
) -> Reply {
    batch_result_inner(&state.jobs, &user, job_id).await
}

pub async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    PathParams(job_id): PathParams<Uuid>,
) -> Reply {
    cancel_inner(&state.jobs, &user, job_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::{make_state, make_user};
    use crate::subsystems::synthesis::tests::ScriptedVision;
    use crate::subsystems::capture::{self, ScreenshotUpload, StartSession};
    use axum::http::StatusCode;
    use axum::Json;
    use processmaster_core::config::VisionConfig;
    use processmaster_core::models::Role;
    use processmaster_core::AnthropicVisionClient;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mock_client(base_url: String) -> AnthropicVisionClient {
        AnthropicVisionClient::with_base_url(
            VisionConfig {
                api_key: "test-api-key".to_string(),
                model: "claude-test".to_string(),
                max_retries: 0,
                retry_delay_ms: 10,
                timeout_secs: 5,
                ..VisionConfig::default()
            },
            base_url,
        )
        .unwrap()
    }

    fn png() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(8, 8, image::Rgba([40, 80, 120, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_image_count_bounds() {
        assert!(check_image_count(0, 50, "images").is_err());
        assert!(check_image_count(1, 50, "images").is_ok());
        assert!(check_image_count(50, 50, "images").is_ok());
        let err = check_image_count(51, 50, "images").unwrap_err();
        assert_eq!(err.classify().0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_media_type_detection() {
        let file = |name: &str, ct: Option<&str>| UploadedFile {
            field: "images".into(),
            filename: Some(name.into()),
            content_type: ct.map(str::to_string),
            bytes: vec![],
        };
        assert_eq!(media_type_of(&file("a.png", Some("image/jpeg"))), "image/jpeg");
        assert_eq!(
            media_type_of(&file("a.webp", Some("application/octet-stream"))),
            "image/webp"
        );
        assert_eq!(media_type_of(&file("blob", None)), "image/png");
    }

    #[tokio::test]
    async fn test_analyze_reports_failures_inline() {
        let vision = ScriptedVision::new();
        let form = MultipartForm::default()
            .with_file("images", "one.png", b"login-button".to_vec())
            .with_file("images", "two.png", b"bad-bytes".to_vec())
            .with_field("context", "Signing in");

        let (status, Json(body)) = analyze_inner(&vision, 2, 50, form).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        let data = &body["data"];
        assert_eq!(data["totalImages"], 2);
        assert_eq!(data["successfulAnalyses"], 1);
        assert_eq!(data["analyses"][0]["filename"], "one.png");
        assert_eq!(data["analyses"][0]["analysis"]["description"], "Signing in");
        assert_eq!(data["analyses"][1]["error"], "Analysis failed");
        assert_eq!(data["analyses"][1]["confidence"], 0);
    }

    #[tokio::test]
    async fn test_analyze_without_images_is_rejected() {
        let vision = ScriptedVision::new();
        let err = analyze_inner(&vision, 2, 50, MultipartForm::default())
            .await
            .unwrap_err();
        assert_eq!(err.classify().1, "VALIDATION_ERROR");
    }

    #[test]
    fn test_models_lists_configured_model() {
        let (_, Json(body)) = models_inner(&ScriptedVision::new()).unwrap();
        assert_eq!(body["data"]["defaultModel"], "scripted");
        assert_eq!(body["data"]["models"][0]["id"], "scripted");
    }

    #[tokio::test]
    async fn test_model_test_reports_latency_and_reply() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "content": [{ "type": "text", "text": "Model test successful" }]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = mock_client(mock_server.uri());
        let (status, Json(body)) = test_model_inner(&client).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        let data = &body["data"];
        assert_eq!(data["success"], true);
        assert_eq!(data["modelId"], "claude-test");
        assert_eq!(data["response"], "Model test successful");
        assert!(data["latencyMs"].is_u64());
        assert!(data.get("error").is_none());
    }

    #[tokio::test]
    async fn test_model_test_reports_upstream_failure() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": { "type": "authentication_error", "message": "invalid x-api-key" }
            })))
            .mount(&mock_server)
            .await;

        let client = mock_client(mock_server.uri());
        let (status, Json(body)) = test_model_inner(&client).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        let data = &body["data"];
        assert_eq!(data["success"], false);
        assert!(data["error"].as_str().unwrap().contains("invalid x-api-key"));
        assert!(data["latencyMs"].is_u64());
    }

    #[tokio::test]
    async fn test_job_sources_must_belong_to_caller() {
        let state = match make_state().await {
            Some(s) => s,
            None => {
                eprintln!("Skipping test_job_sources_must_belong_to_caller: DB unavailable");
                return;
            }
        };
        let (_, owner) = make_user(&state, Role::User).await;
        let (_, intruder) = make_user(&state, Role::User).await;

        let session = capture::start_session(&state.pool, owner.id, StartSession::default())
            .await
            .unwrap();
        let shot = capture::add_screenshot(
            &state.pool,
            state.store.as_ref(),
            &Default::default(),
            session.id,
            owner.id,
            ScreenshotUpload {
                bytes: png(),
                ..ScreenshotUpload::default()
            },
        )
        .await
        .unwrap();
        let upload = format!("screenshot/{}/2024-01-01/x_login.png", owner.id);

        for key in [shot.storage_key.clone(), upload.clone()] {
            let err = batch_analyze_inner(
                &state.pool,
                &state.jobs,
                &intruder,
                BatchInput {
                    image_urls: vec![key.clone()],
                    context: None,
                },
            )
            .await
            .unwrap_err();
            assert_eq!(err.classify().0, StatusCode::FORBIDDEN, "batch with {}", key);

            let err = generate_inner(
                &state.pool,
                &state.jobs,
                &intruder,
                GenerateInput {
                    screenshots: vec![key.clone()],
                    ..GenerateInput::default()
                },
            )
            .await
            .unwrap_err();
            assert_eq!(err.classify().0, StatusCode::FORBIDDEN, "generate with {}", key);
        }

        let queued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ai_processing_jobs WHERE user_id = $1")
            .bind(intruder.id)
            .fetch_one(&state.pool)
            .await
            .unwrap();
        assert_eq!(queued, 0);

        let (status, _) = batch_analyze_inner(
            &state.pool,
            &state.jobs,
            &owner,
            BatchInput {
                image_urls: vec![shot.storage_key.clone(), upload],
                context: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_batch_job_lifecycle_and_cancel() {
        let state = match make_state().await {
            Some(s) => s,
            None => {
                eprintln!("Skipping test_batch_job_lifecycle_and_cancel: DB unavailable");
                return;
            }
        };
        let (_, user) = make_user(&state, Role::User).await;
        let (_, other) = make_user(&state, Role::User).await;

        let (_, Json(body)) = batch_analyze_inner(
            &state.pool,
            &state.jobs,
            &user,
            BatchInput {
                image_urls: vec![
                    "https://images.example.test/a.png".into(),
                    "https://images.example.test/b.png".into(),
                    "https://images.example.test/c.png".into(),
                ],
                context: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(body["data"]["imageCount"], 3);
        assert_eq!(body["data"]["estimatedTime"], "6 seconds");
        let job_id: Uuid = serde_json::from_value(body["data"]["jobId"].clone()).unwrap();

        let (_, Json(status)) = batch_status_inner(&state.jobs, &user, job_id).await.unwrap();
        assert_eq!(status["data"]["status"], "pending");

        let err = batch_status_inner(&state.jobs, &other, job_id).await.unwrap_err();
        assert_eq!(err.classify().0, StatusCode::NOT_FOUND);

        let err = batch_result_inner(&state.jobs, &user, job_id).await.unwrap_err();
        assert_eq!(err.classify().0, StatusCode::NOT_FOUND);

        let (_, Json(cancelled)) = cancel_inner(&state.jobs, &user, job_id).await.unwrap();
        assert_eq!(cancelled["data"]["status"], "failed");

        let err = cancel_inner(&state.jobs, &user, job_id).await.unwrap_err();
        assert_eq!(err.classify().1, "JOB_FINISHED");
    }

    #[tokio::test]
    async fn test_enhance_is_recorded() {
        let state = match make_state().await {
            Some(s) => s,
            None => {
                eprintln!("Skipping test_enhance_is_recorded: DB unavailable");
                return;
            }
        };
        let (_, user) = make_user(&state, Role::User).await;

        let enhanced = content::enhance(
            state.vision.as_ref(),
            &state.jobs,
            user.id,
            EnhanceRequest {
                content: Some("click save".into()),
                ..EnhanceRequest::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(enhanced.enhanced_content, "CLICK SAVE");

        let recorded: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM ai_processing_jobs WHERE user_id = $1 AND job_type = 'enhance' AND status = 'completed'",
        )
        .bind(user.id)
        .fetch_one(&state.pool)
        .await
        .unwrap();
        assert_eq!(recorded, 1);
    }
}
