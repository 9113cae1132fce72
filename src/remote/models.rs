// ABOUTME: Data structures exchanged with batch processors and the jobs table
// ABOUTME: These are deserialized from edge function and PostgREST JSON responses

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Result of one batch processor call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    #[serde(default)]
    pub success_count: u64,
    /// Absent when the processor did not report a count
    #[serde(default)]
    pub remaining: Option<u64>,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub total: u64,
    pub chunks_with_embeddings: Option<u64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl BatchResult {
    /// The processor reports nothing left to do. A missing `remaining`
    /// count is not a completion signal.
    pub fn is_finished(&self) -> bool {
        self.complete || self.remaining == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub percent: Option<f64>,
}

/// Server-tracked job row from `background_jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub id: String,
    pub job_type: String,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<JobProgress>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReindexJobResponse {
    pub job_id: String,
}

/// Global index counts used as the baseline for each backfill run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStatus {
    #[serde(default)]
    pub total_chunks: u64,
    #[serde(default)]
    pub chunks_with_embeddings: u64,
    #[serde(default)]
    pub ner_completed: u64,
    #[serde(default)]
    pub ner_pending: u64,
    #[serde(default)]
    pub total_calls: u64,
    #[serde(default)]
    pub calls_with_deal_heat: u64,
}

impl IndexStatus {
    pub fn missing_embeddings(&self) -> u64 {
        self.total_chunks.saturating_sub(self.chunks_with_embeddings)
    }

    pub fn missing_deal_heat(&self) -> u64 {
        self.total_calls.saturating_sub(self.calls_with_deal_heat)
    }
}
