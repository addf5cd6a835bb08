//! Guide synthesis pipeline
//!
//! Turns an ordered list of screenshots (plus optional interaction hints)
//! into numbered steps, a summary, an estimated time and a difficulty.
//!
//! Three entry points share the same core:
//! - [`generate_guide_from_session`] persists a draft guide; one failed
//!   analysis fails the whole run.
//! - [`generate_instructions`] returns the draft without persisting it.
//! - [`analyze_batch`] analyzes images independently and reports per-item
//!   failures inline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use processmaster_core::imaging::sniff_media_type;
use processmaster_core::models::interaction::{describe_interaction, INTERACTION_COLUMNS};
use processmaster_core::models::screenshot::SCREENSHOT_COLUMNS;
use processmaster_core::models::{Difficulty, Interaction, Job, JobType, Screenshot};
use processmaster_core::{
    AiServiceError, Coordinates, ObjectStore, ScreenshotAnalysis, StepOutline, StorageError,
    VisionBackend,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use super::jobs::JobHandler;

/// Seconds of user effort assumed per step.
const SECONDS_PER_STEP: usize = 30;

#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("Capture session has no screenshots")]
    EmptyInput,

    #[error("Invalid job input: {0}")]
    InvalidInput(String),

    #[error("Failed to fetch image {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("Vision model error: {0}")]
    Vision(#[from] AiServiceError),

    #[error("Object store error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Job attempt {0} is no longer current")]
    Superseded(i32),
}

// ============================================================================
// Image sources
// ============================================================================

/// Resolves an image reference to bytes and a media type.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, source: &str) -> Result<(Vec<u8>, String), SynthesisError>;
}

pub fn is_remote_source(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// `http(s)://` sources are downloaded; anything else is an object-store key.
/// Callers check key ownership before a source reaches the fetcher.
pub struct StoreOrHttpFetcher {
    store: Arc<dyn ObjectStore>,
    http: reqwest::Client,
}

impl StoreOrHttpFetcher {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { store, http }
    }
}

#[async_trait]
impl ImageFetcher for StoreOrHttpFetcher {
    async fn fetch(&self, source: &str) -> Result<(Vec<u8>, String), SynthesisError> {
        let fetch_err = |message: String| SynthesisError::Fetch {
            url: source.to_string(),
            message,
        };

        let (bytes, declared) = if is_remote_source(source) {
            let resp = self
                .http
                .get(source)
                .send()
                .await
                .map_err(|e| fetch_err(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(fetch_err(format!("HTTP {}", resp.status())));
            }
            let declared = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let bytes = resp.bytes().await.map_err(|e| fetch_err(e.to_string()))?;
            (bytes.to_vec(), declared)
        } else {
            (self.store.get(source).await?, None)
        };

        let media_type = sniff_media_type(&bytes)
            .map(|m| m.to_string())
            .or(declared)
            .unwrap_or_else(|| "image/png".to_string());
        Ok((bytes, media_type))
    }
}

// ============================================================================
// Core pipeline
// ============================================================================

/// One image to analyze, with the hint recorded at the same position.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub source: String,
    pub hint: Option<String>,
    pub screenshot_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizedStep {
    pub step_number: i32,
    pub action: String,
    pub element: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuideDraft {
    pub steps: Vec<SynthesizedStep>,
    pub summary: String,
    pub estimated_time: String,
    pub difficulty: Difficulty,
}

/// `30 seconds` per step, rendered as `"<n> seconds"`.
pub fn estimate_completion_time(step_count: usize) -> String {
    format!("{} seconds", step_count * SECONDS_PER_STEP)
}

/// Number steps from 1 in input order; each keeps its screenshot reference.
pub fn assemble_steps(analyses: Vec<ScreenshotAnalysis>, inputs: &[ImageInput]) -> Vec<SynthesizedStep> {
    analyses
        .into_iter()
        .enumerate()
        .map(|(i, a)| SynthesizedStep {
            step_number: i as i32 + 1,
            action: a.action,
            element: a.element,
            description: a.description,
            coordinates: a.coordinates,
            confidence: a.confidence,
            screenshot_id: inputs.get(i).and_then(|input| input.screenshot_id),
        })
        .collect()
}

/// Analyze every input with bounded concurrency. Results keep input order;
/// the first failure aborts the run.
pub async fn analyze_in_order(
    vision: &dyn VisionBackend,
    fetcher: &dyn ImageFetcher,
    inputs: &[ImageInput],
    concurrency: usize,
) -> Result<Vec<ScreenshotAnalysis>, SynthesisError> {
    stream::iter(inputs.to_vec())
        .map(move |input| analyze_one(vision, fetcher, input.source, input.hint))
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}

async fn analyze_one(
    vision: &dyn VisionBackend,
    fetcher: &dyn ImageFetcher,
    source: String,
    hint: Option<String>,
) -> Result<ScreenshotAnalysis, SynthesisError> {
    let (bytes, media_type) = fetcher.fetch(&source).await?;
    Ok(vision
        .analyze_screenshot(&bytes, &media_type, hint.as_deref())
        .await?)
}

/// Steps, summary, time estimate and difficulty for `inputs`.
pub async fn draft_guide(
    vision: &dyn VisionBackend,
    fetcher: &dyn ImageFetcher,
    inputs: &[ImageInput],
    concurrency: usize,
) -> Result<GuideDraft, SynthesisError> {
    let analyses = analyze_in_order(vision, fetcher, inputs, concurrency).await?;
    let steps = assemble_steps(analyses, inputs);

    let outlines: Vec<StepOutline> = steps
        .iter()
        .map(|s| StepOutline {
            action: s.action.clone(),
            description: s.description.clone(),
        })
        .collect();
    let summary = vision.summarize_steps(&outlines).await?;

    Ok(GuideDraft {
        estimated_time: estimate_completion_time(steps.len()),
        difficulty: Difficulty::from_step_count(steps.len()),
        summary,
        steps,
    })
}

// ============================================================================
// Session -> persisted guide
// ============================================================================

/// Analyze a session's screenshots and persist the result as a draft guide.
///
/// The guide insert, the session's `completed` status and the job's
/// `completed` status commit together, under a lock on the job row that
/// requires `job`'s attempt to still be running. A rerun for a session that
/// already has a guide reuses it. Returns the guide id.
pub async fn generate_guide_from_session(
    pool: &PgPool,
    vision: &dyn VisionBackend,
    fetcher: &dyn ImageFetcher,
    concurrency: usize,
    job: &Job,
) -> Result<Uuid, SynthesisError> {
    let (Some(session_id), Some(user_id)) = (job.capture_session_id, job.user_id) else {
        return Err(SynthesisError::InvalidInput(
            "session job needs a session and an owner".to_string(),
        ));
    };

    let draft = if session_guide(pool, session_id).await?.is_some() {
        tracing::info!(session_id = %session_id, job_id = %job.id, "Session already has a guide; finalizing");
        None
    } else {
        Some(draft_session(pool, vision, fetcher, concurrency, session_id).await?)
    };

    let mut tx = pool.begin().await?;
    lock_current_attempt(&mut tx, job).await?;

    let existing: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM guides WHERE capture_session_id = $1 ORDER BY created_at LIMIT 1 FOR UPDATE",
    )
    .bind(session_id)
    .fetch_optional(&mut *tx)
    .await?;

    let guide_id = match (existing, draft) {
        (Some(guide_id), _) => guide_id,
        (None, Some(draft)) => {
            let guide_id = insert_guide(&mut tx, vision.model(), session_id, user_id, &draft).await?;
            tracing::info!(
                session_id = %session_id,
                guide_id = %guide_id,
                steps = draft.steps.len(),
                "Guide generated"
            );
            guide_id
        }
        (None, None) => {
            return Err(SynthesisError::InvalidInput(
                "session guide was removed during generation".to_string(),
            ))
        }
    };

    sqlx::query(
        "UPDATE capture_sessions SET status = 'completed', processed_at = NOW() WHERE id = $1",
    )
    .bind(session_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE ai_processing_jobs
        SET status = 'completed', output_data = $2, guide_id = $3, error_message = NULL,
            processing_time = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT,
            completed_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job.id)
    .bind(serde_json::json!({ "guideId": guide_id }))
    .bind(guide_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(guide_id)
}

async fn session_guide(pool: &PgPool, session_id: Uuid) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar("SELECT id FROM guides WHERE capture_session_id = $1 ORDER BY created_at LIMIT 1")
        .bind(session_id)
        .fetch_optional(pool)
        .await
}

/// Fails with `Superseded` unless `job`'s attempt is still the running one.
async fn lock_current_attempt(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job: &Job,
) -> Result<(), SynthesisError> {
    let row: Option<(String, i32)> =
        sqlx::query_as("SELECT status, attempts FROM ai_processing_jobs WHERE id = $1 FOR UPDATE")
            .bind(job.id)
            .fetch_optional(&mut **tx)
            .await?;

    match row {
        Some((status, attempts)) if status == "running" && attempts == job.attempts => Ok(()),
        _ => Err(SynthesisError::Superseded(job.attempts)),
    }
}

async fn draft_session(
    pool: &PgPool,
    vision: &dyn VisionBackend,
    fetcher: &dyn ImageFetcher,
    concurrency: usize,
    session_id: Uuid,
) -> Result<GuideDraft, SynthesisError> {
    let screenshots = sqlx::query_as::<_, Screenshot>(&format!(
        "SELECT {SCREENSHOT_COLUMNS} FROM screenshots WHERE capture_session_id = $1 ORDER BY sequence_number"
    ))
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    if screenshots.is_empty() {
        return Err(SynthesisError::EmptyInput);
    }

    let interactions = sqlx::query_as::<_, Interaction>(&format!(
        "SELECT {INTERACTION_COLUMNS} FROM user_interactions WHERE capture_session_id = $1 ORDER BY sequence_number"
    ))
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    let inputs: Vec<ImageInput> = screenshots
        .iter()
        .enumerate()
        .map(|(i, s)| ImageInput {
            source: s.storage_key.clone(),
            hint: interactions.get(i).map(|it| it.context_hint()),
            screenshot_id: Some(s.id),
        })
        .collect();

    tracing::info!(
        session_id = %session_id,
        screenshots = screenshots.len(),
        interactions = interactions.len(),
        "Generating guide from capture session"
    );

    draft_guide(vision, fetcher, &inputs, concurrency).await
}

async fn insert_guide(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    model: &str,
    session_id: Uuid,
    user_id: Uuid,
    draft: &GuideDraft,
) -> Result<Uuid, sqlx::Error> {
    let now = Utc::now();

    let guide_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO guides (user_id, capture_session_id, title, description, content, tags,
                            status, visibility, difficulty, estimated_time)
        VALUES ($1, $2, $3, $4, $5, '{}', 'draft', 'private', $6, $7)
        RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(session_id)
    .bind(format!("Process Guide - {}", now.format("%Y-%m-%d")))
    .bind(&draft.summary)
    .bind(serde_json::json!({
        "steps": draft.steps,
        "metadata": {
            "aiGenerated": true,
            "model": model,
            "sessionId": session_id,
            "generatedAt": now.to_rfc3339(),
        }
    }))
    .bind(draft.difficulty.as_str())
    .bind(&draft.estimated_time)
    .fetch_one(&mut **tx)
    .await?;

    for step in &draft.steps {
        sqlx::query(
            r#"
            INSERT INTO guide_steps (guide_id, step_number, title, description, action_type,
                                     element_description, screenshot_id, coordinates)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(guide_id)
        .bind(step.step_number)
        .bind(format!("Step {}", step.step_number))
        .bind(&step.description)
        .bind(&step.action)
        .bind(&step.element)
        .bind(step.screenshot_id)
        .bind(step.coordinates.map(|c| serde_json::json!({ "x": c.x, "y": c.y })))
        .execute(&mut **tx)
        .await?;
    }

    Ok(guide_id)
}

// ============================================================================
// Ad-hoc instructions and batch analysis
// ============================================================================

/// Interaction hint supplied with `POST /ai/generate`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionHint {
    #[serde(alias = "type")]
    pub interaction_type: String,
    #[serde(default)]
    pub element_selector: Option<String>,
    #[serde(default)]
    pub element_text: Option<String>,
    #[serde(default, alias = "url")]
    pub page_url: Option<String>,
}

impl InteractionHint {
    pub fn context_hint(&self) -> String {
        describe_interaction(
            &self.interaction_type,
            self.element_selector.as_deref(),
            self.element_text.as_deref(),
            self.page_url.as_deref(),
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateInput {
    pub screenshots: Vec<String>,
    #[serde(default)]
    pub interactions: Vec<InteractionHint>,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchInput {
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub context: Option<String>,
}

/// `{steps, summary, estimatedTime, difficulty}` without persisting anything.
pub async fn generate_instructions(
    vision: &dyn VisionBackend,
    fetcher: &dyn ImageFetcher,
    concurrency: usize,
    input: &GenerateInput,
) -> Result<serde_json::Value, SynthesisError> {
    if input.screenshots.is_empty() {
        return Err(SynthesisError::EmptyInput);
    }

    let inputs: Vec<ImageInput> = input
        .screenshots
        .iter()
        .enumerate()
        .map(|(i, source)| ImageInput {
            source: source.clone(),
            hint: input
                .interactions
                .get(i)
                .map(|h| h.context_hint())
                .or_else(|| input.context.clone()),
            screenshot_id: None,
        })
        .collect();

    let draft = draft_guide(vision, fetcher, &inputs, concurrency).await?;
    Ok(serde_json::to_value(&draft)?)
}

/// Analyze each image independently. Always completes; failures are
/// reported as `{url, error, success:false}` entries.
pub async fn analyze_batch(
    vision: &dyn VisionBackend,
    fetcher: &dyn ImageFetcher,
    concurrency: usize,
    input: &BatchInput,
) -> serde_json::Value {
    let context = input.context.clone();

    let analyses: Vec<serde_json::Value> = stream::iter(input.image_urls.clone())
        .map(move |url| {
            let context = context.clone();
            async move {
                match analyze_one(vision, fetcher, url.clone(), context).await {
                    Ok(analysis) => serde_json::json!({
                        "url": url,
                        "analysis": analysis,
                        "success": true,
                    }),
                    Err(e) => {
                        tracing::warn!(url = %url, error = %e, "Batch item failed");
                        serde_json::json!({
                            "url": url,
                            "error": e.to_string(),
                            "success": false,
                        })
                    }
                }
            }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let success_count = analyses.iter().filter(|a| a["success"] == true).count();

    serde_json::json!({
        "analyses": analyses,
        "successCount": success_count,
        "totalImages": input.image_urls.len(),
    })
}

// ============================================================================
// Job handler
// ============================================================================

/// Executes queued `generate` and `batch_analyze` jobs.
pub struct PipelineJobHandler {
    pool: PgPool,
    vision: Arc<dyn VisionBackend>,
    fetcher: Arc<dyn ImageFetcher>,
    concurrency: usize,
}

impl PipelineJobHandler {
    pub fn new(
        pool: PgPool,
        vision: Arc<dyn VisionBackend>,
        fetcher: Arc<dyn ImageFetcher>,
        concurrency: usize,
    ) -> Self {
        Self {
            pool,
            vision,
            fetcher,
            concurrency,
        }
    }
}

#[async_trait]
impl JobHandler for PipelineJobHandler {
    async fn run(&self, job: &Job) -> Result<serde_json::Value, SynthesisError> {
        match (job.job_type, job.capture_session_id) {
            (JobType::Generate, Some(_)) => {
                let guide_id = generate_guide_from_session(
                    &self.pool,
                    self.vision.as_ref(),
                    self.fetcher.as_ref(),
                    self.concurrency,
                    job,
                )
                .await?;
                Ok(serde_json::json!({ "guideId": guide_id }))
            }
            (JobType::Generate, None) => {
                let input: GenerateInput = serde_json::from_value(job.input_data.clone())
                    .map_err(|e| SynthesisError::InvalidInput(e.to_string()))?;
                generate_instructions(
                    self.vision.as_ref(),
                    self.fetcher.as_ref(),
                    self.concurrency,
                    &input,
                )
                .await
            }
            (JobType::BatchAnalyze, _) => {
                let input: BatchInput = serde_json::from_value(job.input_data.clone())
                    .map_err(|e| SynthesisError::InvalidInput(e.to_string()))?;
                Ok(analyze_batch(
                    self.vision.as_ref(),
                    self.fetcher.as_ref(),
                    self.concurrency,
                    &input,
                )
                .await)
            }
            (other, _) => Err(SynthesisError::InvalidInput(format!(
                "{} jobs are not queued",
                other
            ))),
        }
    }
}
