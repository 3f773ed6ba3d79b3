use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Default number of scrape attempts per job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// The catalogs screenshots can be fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Store {
    PlayStore,
    AppStore,
}

impl Store {
    pub const ALL: [Store; 2] = [Store::PlayStore, Store::AppStore];

    pub fn as_str(&self) -> &'static str {
        match self {
            Store::PlayStore => "playstore",
            Store::AppStore => "appstore",
        }
    }

    /// Check that `app_id` has the shape this store uses.
    ///
    /// Play Store ids are Java-style package names (`com.example.app`);
    /// App Store ids are numeric track ids, optionally written as `id123456`.
    pub fn validate_app_id(&self, app_id: &str) -> Result<(), AppError> {
        let valid = match self {
            Store::PlayStore => is_package_name(app_id),
            Store::AppStore => {
                let digits = app_id.strip_prefix("id").unwrap_or(app_id);
                digits.len() > 3 && digits.bytes().all(|b| b.is_ascii_digit())
            }
        };
        if valid {
            Ok(())
        } else {
            Err(AppError::ValidationError(format!(
                "'{app_id}' is not a valid {self} app id"
            )))
        }
    }
}

fn is_package_name(app_id: &str) -> bool {
    if app_id.len() <= 3 || app_id.len() > 255 {
        return false;
    }
    let mut segments = 0;
    for segment in app_id.split('.') {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => {}
            _ => return false,
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return false;
        }
        segments += 1;
    }
    segments >= 2
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Store {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "playstore" | "play_store" | "googleplay" => Ok(Store::PlayStore),
            "appstore" | "app_store" | "itunes" => Ok(Store::AppStore),
            _ => Err(AppError::ValidationError(format!("Unknown store: {s}"))),
        }
    }
}

/// Status of a job in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Retrying,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Retrying,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the lifecycle graph has an edge `self -> next`.
    ///
    /// ```text
    /// pending -> queued -> processing -> completed
    ///              ^            |-----> failed
    ///              |            v
    ///              +------- retrying
    /// ```
    ///
    /// Any non-terminal status may also fail outright.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Queued) | (Queued, Processing) | (Retrying, Queued) => true,
            (Processing, Completed) | (Processing, Retrying) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "retrying" => Ok(JobStatus::Retrying),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Queue priority. Interactive single-app requests outrank batch work,
/// which outranks maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Interactive,
    Batch,
    Maintenance,
}

impl Priority {
    /// Numeric weight; higher is served first.
    pub fn weight(&self) -> i16 {
        match self {
            Priority::Interactive => 10,
            Priority::Batch => 5,
            Priority::Maintenance => 1,
        }
    }

    pub fn from_weight(weight: i16) -> Self {
        match weight {
            w if w >= 10 => Priority::Interactive,
            w if w >= 5 => Priority::Batch,
            _ => Priority::Maintenance,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Interactive => "interactive",
            Priority::Batch => "batch",
            Priority::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A screenshot scrape job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub app_id: String,
    pub store: Store,
    pub client_id: String,
    pub priority: Priority,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result: Vec<String>,
    /// True for jobs answered straight from the screenshot cache.
    pub from_cache: bool,
}

impl Job {
    /// Build a fresh `pending` job.
    pub fn from_request(request: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            app_id: request.app_id,
            store: request.store,
            client_id: request.client_id,
            priority: request.priority,
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts: request.max_attempts,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            result: Vec::new(),
            from_cache: false,
        }
    }

    /// Build an already-completed job backed by a cached result.
    pub fn cached(
        request: NewJob,
        result: Vec<String>,
        scraped_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut job = Self::from_request(request, now);
        job.status = JobStatus::Completed;
        job.completed_at = Some(scraped_at);
        job.result = result;
        job.from_cache = true;
        job
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Rough completion percentage for polling clients.
    pub fn progress_estimate(&self) -> f32 {
        match self.status {
            JobStatus::Pending => 0.0,
            JobStatus::Queued => 10.0,
            JobStatus::Retrying => {
                let max = self.max_attempts.max(1) as f32;
                10.0 + 80.0 * (self.attempt_count as f32 / max)
            }
            JobStatus::Processing => 50.0,
            JobStatus::Completed | JobStatus::Failed => 100.0,
        }
    }

    /// Apply a lifecycle transition in place.
    ///
    /// Fails with [`AppError::StateConflict`] when the graph has no such
    /// edge, leaving the job untouched.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> Result<(), AppError> {
        let target = transition.target();
        if !self.status.can_transition_to(target) {
            return Err(AppError::StateConflict {
                job_id: self.id,
                from: self.status,
                to: target,
            });
        }

        match transition {
            Transition::Queue => {}
            Transition::Start => {
                if self.attempts_exhausted() {
                    return Err(AppError::AttemptsExhausted {
                        job_id: self.id,
                        max_attempts: self.max_attempts,
                    });
                }
                self.attempt_count += 1;
                self.started_at = Some(now);
            }
            Transition::Complete { result } => {
                self.result = result;
                self.completed_at = Some(now);
                self.error_message = None;
            }
            Transition::Retry { error } => {
                self.error_message = Some(error);
            }
            Transition::Fail { error } => {
                self.error_message = Some(error);
                self.completed_at = Some(now);
            }
        }

        self.status = target;
        self.updated_at = now;
        Ok(())
    }
}

/// Request to create a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub app_id: String,
    pub store: Store,
    pub client_id: String,
    pub priority: Priority,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(app_id: impl Into<String>, store: Store, client_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            store,
            client_id: client_id.into(),
            priority: Priority::Interactive,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }
}

/// A requested lifecycle step, carrying the fields it sets.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// `pending|retrying -> queued`
    Queue,
    /// `queued -> processing`; counts one attempt and stamps `started_at`.
    Start,
    /// `processing -> completed`
    Complete { result: Vec<String> },
    /// `processing -> retrying`
    Retry { error: String },
    /// any non-terminal status `-> failed`
    Fail { error: String },
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Queue => JobStatus::Queued,
            Transition::Start => JobStatus::Processing,
            Transition::Complete { .. } => JobStatus::Completed,
            Transition::Retry { .. } => JobStatus::Retrying,
            Transition::Fail { .. } => JobStatus::Failed,
        }
    }
}

/// Message published to a store queue.
///
/// `attempt` is the number of attempts already made when it was published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: Uuid,
    pub app_id: String,
    pub store: Store,
    pub attempt: u32,
    /// Scrape even if a result was cached after the job was submitted.
    #[serde(default)]
    pub force_refresh: bool,
}

impl QueueMessage {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            app_id: job.app_id.clone(),
            store: job.store,
            attempt: job.attempt_count,
            force_refresh: false,
        }
    }

    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }
}

/// What a polling client sees.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusReport {
    pub job_id: Uuid,
    pub app_id: String,
    pub store: Store,
    pub status: JobStatus,
    pub result: Vec<String>,
    pub progress_estimate: f32,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub error_message: Option<String>,
    pub from_cache: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobStatusReport {
    fn from(job: Job) -> Self {
        let progress_estimate = job.progress_estimate();
        Self {
            job_id: job.id,
            app_id: job.app_id,
            store: job.store,
            status: job.status,
            result: job.result,
            progress_estimate,
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            error_message: job.error_message,
            from_cache: job.from_cache,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}
