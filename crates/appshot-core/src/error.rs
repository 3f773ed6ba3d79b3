use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

/// Application-wide error types for Appshot.
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed `app_id` or `store` in a submission.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Admission denied by the tier rate limit.
    #[error("Quota exceeded, retry after {} seconds", retry_after_secs(.retry_after))]
    QuotaExceeded { retry_after: Duration },

    /// The account's decrementing balance is used up.
    #[error("Account quota exhausted for client '{0}'")]
    QuotaExhausted(String),

    /// The caller's tier may not use this operation.
    #[error("Tier '{tier}' is not allowed to use {operation}")]
    TierForbidden { tier: String, operation: String },

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    /// A job transition that the lifecycle graph does not allow.
    #[error("Illegal transition for job {job_id}: {from} -> {to}")]
    StateConflict {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    /// A new attempt was requested for a job that already used all of them.
    #[error("Job {job_id} has used all {max_attempts} attempts")]
    AttemptsExhausted { job_id: Uuid, max_attempts: u32 },

    /// Scraper failure worth retrying (network, timeout, throttling).
    #[error("Transient scrape error: {0}")]
    TransientScrapeError(String),

    /// Scraper failure that will not go away on retry.
    #[error("Permanent scrape error: {0}")]
    PermanentScrapeError(String),

    /// Scrape call exceeded the per-task timeout.
    #[error("Scrape timed out after {0} seconds")]
    Timeout(u64),

    /// Cache backend unreachable or misbehaving.
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Message broker unreachable; submissions cannot proceed.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

fn retry_after_secs(retry_after: &Duration) -> u64 {
    // Round up so a caller never retries before the window resets.
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::TransientScrapeError(_)
                | AppError::Timeout(_)
                | AppError::BrokerUnavailable(_)
                | AppError::DatabaseError(_)
        )
    }

    /// Returns true for errors the caller caused (and can fix), as opposed
    /// to infrastructure failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AppError::ValidationError(_)
                | AppError::QuotaExceeded { .. }
                | AppError::QuotaExhausted(_)
                | AppError::TierForbidden { .. }
                | AppError::NotFound(_)
        )
    }

    /// Seconds a caller should wait before retrying, when the error carries one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            AppError::QuotaExceeded { retry_after } => Some(retry_after_secs(retry_after)),
            _ => None,
        }
    }
}
