use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use appshot_core::job::{Job, JobStatusReport};
use appshot_core::service::{BatchItem, QueueStats, SubmitResponse};

// ---------------------------------------------------------------------------
// Submissions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ScrapeRequest {
    /// Play Store package name or App Store numeric id.
    pub app_id: String,
    /// `playstore` or `appstore`.
    pub store: String,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    pub status: String,
    pub from_cache: bool,
}

impl From<SubmitResponse> for SubmitJobResponse {
    fn from(r: SubmitResponse) -> Self {
        Self {
            job_id: r.job_id,
            status: r.status.to_string(),
            from_cache: r.from_cache,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct BatchEntry {
    pub app_id: String,
    pub store: String,
}

impl From<BatchEntry> for BatchItem {
    fn from(e: BatchEntry) -> Self {
        BatchItem {
            app_id: e.app_id,
            store: e.store,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct BatchRequest {
    pub apps: Vec<BatchEntry>,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct BatchResponse {
    pub jobs: Vec<SubmitJobResponse>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub app_id: String,
    pub store: String,
    pub status: String,
    pub screenshots: Vec<String>,
    /// Rough completion percentage, 0 to 100.
    pub progress_estimate: f32,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub error_message: Option<String>,
    pub from_cache: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<JobStatusReport> for JobStatusResponse {
    fn from(r: JobStatusReport) -> Self {
        Self {
            job_id: r.job_id,
            app_id: r.app_id,
            store: r.store.to_string(),
            status: r.status.to_string(),
            screenshots: r.result,
            progress_estimate: r.progress_estimate,
            attempt_count: r.attempt_count,
            max_attempts: r.max_attempts,
            error_message: r.error_message,
            from_cache: r.from_cache,
            created_at: r.created_at,
            completed_at: r.completed_at,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub app_id: String,
    pub store: String,
    pub client_id: String,
    pub priority: String,
    pub status: String,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl From<Job> for JobSummary {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            app_id: job.app_id,
            store: job.store.to_string(),
            client_id: job.client_id,
            priority: job.priority.to_string(),
            status: job.status.to_string(),
            attempt_count: job.attempt_count,
            created_at: job.created_at,
            updated_at: job.updated_at,
            error_message: job.error_message,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobListResponse {
    pub jobs: Vec<JobSummary>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct InvalidateResponse {
    pub store: String,
    pub app_id: String,
    /// Cache entries actually removed.
    pub removed: u32,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub cache: &'static str,
    pub job_store: &'static str,
    pub broker: &'static str,
    pub queue_depth: BTreeMap<String, u64>,
    pub jobs: BTreeMap<String, u64>,
}

impl HealthResponse {
    pub fn from_stats(backends: BackendNames, stats: Option<QueueStats>) -> Self {
        let status = if stats.is_some() { "healthy" } else { "unhealthy" };
        let stats = stats.unwrap_or(QueueStats {
            queue_depth: BTreeMap::new(),
            jobs: BTreeMap::new(),
        });
        Self {
            status,
            cache: backends.cache,
            job_store: backends.jobs,
            broker: backends.broker,
            queue_depth: stats.queue_depth,
            jobs: stats.jobs,
        }
    }
}

/// Which storage implementation backs each concern.
#[derive(Debug, Clone, Copy)]
pub struct BackendNames {
    pub cache: &'static str,
    pub jobs: &'static str,
    pub broker: &'static str,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub retry_after: Option<u64>,
}
