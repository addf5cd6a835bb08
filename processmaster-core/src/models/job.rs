use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

text_enum! {
    pub enum JobType: "job type" {
        Analyze => "analyze",
        Generate => "generate",
        BatchAnalyze => "batch_analyze",
        Enhance => "enhance",
        Translate => "translate",
    }
}

text_enum! {
    /// `pending -> running -> completed | failed`. A running job whose worker
    /// disappeared is moved back to pending by the recovery sweep.
    pub enum JobStatus: "job status" {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub capture_session_id: Option<Uuid>,
    pub guide_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub job_type: JobType,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub input_data: serde_json::Value,
    /// Only meaningful once `status` is `completed`.
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    /// Wall-clock milliseconds from claim to completion.
    pub processing_time: Option<i64>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub const JOB_COLUMNS: &str = "id, user_id, capture_session_id, guide_id, job_type, status, \
     input_data, output_data, error_message, processing_time, attempts, created_at, started_at, completed_at";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_type_text_round_trip() {
        for t in JobType::ALL {
            assert_eq!(t.as_str().parse::<JobType>().unwrap(), *t);
        }
        assert_eq!(JobType::BatchAnalyze.as_str(), "batch_analyze");
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let err = JobStatus::try_from("queued".to_string()).unwrap_err();
        assert_eq!(err.value, "queued");
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }
}
