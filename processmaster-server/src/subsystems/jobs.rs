//! Durable job queue
//!
//! Jobs are rows in `ai_processing_jobs`. Submitting a job pushes its id
//! onto a bounded channel drained by a fixed pool of workers. A worker owns
//! a job only after the `pending -> running` claim succeeds, so duplicate ids
//! in the channel are harmless.
//!
//! The recovery loop (startup + every `recovery_interval_secs`) requeues
//! running jobs whose worker vanished and re-submits pending jobs that never
//! made it into the channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use processmaster_core::config::JobsConfig;
use processmaster_core::models::job::JOB_COLUMNS;
use processmaster_core::models::{Job, JobStatus, JobType};
use sqlx::PgPool;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::synthesis::SynthesisError;
use crate::error::{ApiError, ApiResult};

pub const CANCELLED_MESSAGE: &str = "cancelled";

/// Work performed for a claimed job. The returned value becomes `output_data`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job) -> Result<serde_json::Value, SynthesisError>;
}

/// Handle shared by request handlers (enqueue, cancel, read) and workers.
#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
    config: JobsConfig,
    tx: mpsc::Sender<Uuid>,
    running: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

/// New pending job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: Uuid,
    pub capture_session_id: Option<Uuid>,
    pub job_type: JobType,
    pub input_data: serde_json::Value,
}

impl JobQueue {
    /// The receiver must be handed to [`JobQueue::spawn_workers`].
    pub fn new(pool: PgPool, config: JobsConfig) -> (Self, mpsc::Receiver<Uuid>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        (
            Self {
                pool,
                config,
                tx,
                running: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        )
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Start `worker_count()` workers sharing `rx`. Workers stop on shutdown.
    pub fn spawn_workers(
        &self,
        rx: mpsc::Receiver<Uuid>,
        handler: Arc<dyn JobHandler>,
        shutdown: &broadcast::Sender<()>,
    ) {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = self.config.worker_count();

        for worker_id in 0..workers {
            let queue = self.clone();
            let rx = rx.clone();
            let handler = handler.clone();
            let mut stop = shutdown.subscribe();

            tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = stop.recv() => None,
                        id = async { rx.lock().await.recv().await } => id,
                    };
                    let Some(job_id) = next else {
                        break;
                    };
                    queue.process(job_id, handler.as_ref()).await;
                }
                tracing::debug!(worker_id, "Job worker stopped");
            });
        }

        tracing::info!(
            workers,
            capacity = self.config.queue_capacity,
            "Job workers started"
        );
    }

    /// Insert a pending job and hand it to the workers.
    pub async fn enqueue(&self, new: NewJob) -> Result<Job, sqlx::Error> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO ai_processing_jobs (user_id, capture_session_id, job_type, status, input_data)
            VALUES ($1, $2, $3, 'pending', $4)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(new.user_id)
        .bind(new.capture_session_id)
        .bind(new.job_type.as_str())
        .bind(&new.input_data)
        .fetch_one(&self.pool)
        .await?;

        self.submit(job.id);
        Ok(job)
    }

    /// Best-effort push. A full channel leaves the job pending for the next
    /// recovery sweep.
    pub fn submit(&self, job_id: Uuid) {
        if let Err(e) = self.tx.try_send(job_id) {
            tracing::warn!(job_id = %job_id, error = %e, "Job channel full, deferring to recovery sweep");
        }
    }

    /// Record a job that already ran synchronously (enhance, translate).
    pub async fn record_completed(
        &self,
        user_id: Uuid,
        job_type: JobType,
        input_data: serde_json::Value,
        output_data: serde_json::Value,
        processing_time_ms: i64,
    ) -> Result<Uuid, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            INSERT INTO ai_processing_jobs (user_id, job_type, status, input_data, output_data,
                                            processing_time, attempts, started_at, completed_at)
            VALUES ($1, $2, 'completed', $3, $4, $5, 1, NOW(), NOW())
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(job_type.as_str())
        .bind(input_data)
        .bind(output_data)
        .bind(processing_time_ms)
        .fetch_one(&self.pool)
        .await
    }

    /// A job visible to `owner`. Jobs without an owner are hidden.
    pub async fn get(&self, job_id: Uuid, owner: Uuid) -> ApiResult<Job> {
        sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM ai_processing_jobs WHERE id = $1 AND user_id = $2"
        ))
        .bind(job_id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("Job not found"))
    }

    /// Latest job for a capture session.
    pub async fn latest_for_session(&self, session_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM ai_processing_jobs
            WHERE capture_session_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Fail a pending or running job with `cancelled` and signal its worker.
    pub async fn cancel(&self, job_id: Uuid, owner: Uuid) -> ApiResult<Job> {
        let mut tx = self.pool.begin().await?;

        let cancelled = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE ai_processing_jobs
            SET status = 'failed', error_message = $3, completed_at = NOW()
            WHERE id = $1 AND user_id = $2 AND status IN ('pending', 'running')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(owner)
        .bind(CANCELLED_MESSAGE)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = cancelled else {
            tx.rollback().await?;
            let existing = self.get(job_id, owner).await?;
            return Err(ApiError::conflict(
                "JOB_FINISHED",
                format!("Job is already {}", existing.status),
            ));
        };

        fail_session_of(&mut tx, &job).await?;
        tx.commit().await?;

        let token = self.lock_running().remove(&job_id);
        if let Some(token) = token {
            token.cancel();
        }

        tracing::info!(job_id = %job_id, "Job cancelled");
        Ok(job)
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim, run under timeout and cancellation, finalize.
    pub async fn process(&self, job_id: Uuid, handler: &dyn JobHandler) {
        let job = match claim(&self.pool, job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!(job_id = %job_id, "Job already claimed or finished");
                return;
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to claim job");
                return;
            }
        };

        let token = CancellationToken::new();
        self.lock_running().insert(job.id, token.clone());

        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "Job started"
        );

        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.job_timeout_secs.max(1));

        let outcome = tokio::select! {
            _ = token.cancelled() => None,
            result = tokio::time::timeout(timeout, handler.run(&job)) => Some(match result {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {}s", timeout.as_secs())),
            }),
        };

        self.lock_running().remove(&job.id);
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let finalized = match outcome {
            None => {
                tracing::info!(job_id = %job.id, "Job stopped after cancellation");
                return;
            }
            Some(Ok(output)) => complete(&self.pool, &job, &output, elapsed_ms).await,
            Some(Err(message)) => {
                tracing::warn!(job_id = %job.id, error = %message, "Job failed");
                fail(&self.pool, &job, &message, elapsed_ms).await
            }
        };

        match finalized {
            Ok(true) => tracing::info!(job_id = %job.id, elapsed_ms, "Job finished"),
            Ok(false) => {
                tracing::warn!(job_id = %job.id, attempt = job.attempts, "Stale attempt, result discarded")
            }
            Err(e) => tracing::error!(job_id = %job.id, error = %e, "Failed to record job outcome"),
        }
    }
}

// ============================================================================
// State transitions
// ============================================================================

/// `pending -> running`. `None` when another worker got there first or the
/// job is no longer pending.
pub async fn claim(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        r#"
        UPDATE ai_processing_jobs
        SET status = 'running', started_at = NOW(), attempts = attempts + 1
        WHERE id = $1 AND status = 'pending'
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await
}

/// `running -> completed` for this attempt only. Returns whether this attempt
/// owns the completed row, including when the handler already finalized it
/// in its own transaction.
pub async fn complete(
    pool: &PgPool,
    job: &Job,
    output: &serde_json::Value,
    elapsed_ms: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE ai_processing_jobs
        SET status = 'completed', output_data = $3, guide_id = $4,
            processing_time = $5, completed_at = NOW(), error_message = NULL
        WHERE id = $1 AND attempts = $2 AND status = 'running'
        "#,
    )
    .bind(job.id)
    .bind(job.attempts)
    .bind(output)
    .bind(
        output
            .get("guideId")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok()),
    )
    .bind(elapsed_ms)
    .execute(pool)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(true);
    }

    sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM ai_processing_jobs WHERE id = $1 AND attempts = $2 AND status = 'completed')",
    )
    .bind(job.id)
    .bind(job.attempts)
    .fetch_one(pool)
    .await
}

/// `running -> failed` for this attempt only; a session-driven job also
/// fails its session.
pub async fn fail(
    pool: &PgPool,
    job: &Job,
    message: &str,
    elapsed_ms: i64,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        r#"
        UPDATE ai_processing_jobs
        SET status = 'failed', error_message = $3, processing_time = $4, completed_at = NOW()
        WHERE id = $1 AND attempts = $2 AND status = 'running'
        "#,
    )
    .bind(job.id)
    .bind(job.attempts)
    .bind(message)
    .bind(elapsed_ms)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    fail_session_of(&mut tx, job).await?;
    tx.commit().await?;
    Ok(true)
}

async fn fail_session_of(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job: &Job,
) -> Result<(), sqlx::Error> {
    if let (JobType::Generate, Some(session_id)) = (job.job_type, job.capture_session_id) {
        sqlx::query("UPDATE capture_sessions SET status = 'failed' WHERE id = $1")
            .bind(session_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

// ============================================================================
// Recovery
// ============================================================================

/// Counts from one recovery sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub abandoned: usize,
    pub resubmitted: usize,
}

/// Run the recovery sweep at startup and then every `recovery_interval_secs`.
pub async fn run_recovery_loop(queue: JobQueue, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(Duration::from_secs(
        queue.config.recovery_interval_secs.max(1),
    ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = queue.config.recovery_interval_secs,
        stuck_after_secs = queue.config.stuck_after_secs,
        "Job recovery loop started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => {
                tracing::info!("Job recovery loop shutting down");
                return;
            }
        }

        match run_recovery_tick(&queue).await {
            Ok(report) => {
                if report != RecoveryReport::default() {
                    tracing::info!(
                        requeued = report.requeued,
                        abandoned = report.abandoned,
                        resubmitted = report.resubmitted,
                        "Job recovery tick complete"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "Job recovery tick failed"),
        }
    }
}

/// One sweep. Public for testing.
pub async fn run_recovery_tick(queue: &JobQueue) -> Result<RecoveryReport, sqlx::Error> {
    let pool = &queue.pool;
    let stuck_after = queue.config.stuck_after_secs as f64;
    let mut report = RecoveryReport::default();

    // Out of attempts: fail them, and their sessions.
    let abandoned = sqlx::query_as::<_, Job>(&format!(
        r#"
        UPDATE ai_processing_jobs
        SET status = 'failed', completed_at = NOW(),
            error_message = 'abandoned after ' || attempts || ' attempts'
        WHERE status = 'running'
          AND started_at < NOW() - make_interval(secs => $1)
          AND attempts >= $2
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(stuck_after)
    .bind(queue.config.max_attempts)
    .fetch_all(pool)
    .await?;

    for job in &abandoned {
        let mut tx = pool.begin().await?;
        fail_session_of(&mut tx, job).await?;
        tx.commit().await?;
        tracing::warn!(job_id = %job.id, attempts = job.attempts, "Job abandoned");
    }
    report.abandoned = abandoned.len();

    let requeued = sqlx::query(
        r#"
        UPDATE ai_processing_jobs
        SET status = 'pending', started_at = NULL
        WHERE status = 'running'
          AND started_at < NOW() - make_interval(secs => $1)
          AND attempts < $2
        "#,
    )
    .bind(stuck_after)
    .bind(queue.config.max_attempts)
    .execute(pool)
    .await?;
    report.requeued = requeued.rows_affected() as usize;

    let pending: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM ai_processing_jobs WHERE status = 'pending' ORDER BY created_at LIMIT $1",
    )
    .bind(queue.config.queue_capacity as i64)
    .fetch_all(pool)
    .await?;

    for id in &pending {
        queue.submit(*id);
    }
    report.resubmitted = pending.len();

    Ok(report)
}

/// Client-facing view of a job's progress.
pub fn status_view(job: &Job) -> serde_json::Value {
    serde_json::json!({
        "jobId": job.id,
        "status": job.status,
        "jobType": job.job_type,
        "attempts": job.attempts,
        "createdAt": job.created_at,
        "startedAt": job.started_at,
        "completedAt": job.completed_at,
        "processingTime": job.processing_time,
        "errorMessage": job.error_message,
    })
}

/// Output of a completed job; anything else is 404.
pub fn result_view(job: &Job) -> ApiResult<serde_json::Value> {
    if job.status != JobStatus::Completed {
        return Err(ApiError::not_found("Completed job not found"));
    }
    Ok(serde_json::json!({
        "jobId": job.id,
        "result": job.output_data,
        "processingTime": job.processing_time,
        "completedAt": job.completed_at,
    }))
}
