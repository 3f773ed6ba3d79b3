use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobStatus, NewJob, Transition};

/// Authoritative record of job identity and lifecycle.
///
/// Status changes go through [`JobStore::transition`] only, which must apply
/// the lifecycle graph atomically per job (check and write under one lock or
/// row lock).
pub trait JobStore: Send + Sync + Clone {
    /// Persist a new `pending` job.
    fn create(&self, request: NewJob) -> impl Future<Output = Result<Job, AppError>> + Send;

    /// Persist a job that was answered from cache and is already `completed`.
    fn record_cached(
        &self,
        request: NewJob,
        result: Vec<String>,
        completed_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Job, AppError>> + Send;

    /// Apply a transition and return the updated job.
    ///
    /// Errors with `NotFound`, `StateConflict` or `AttemptsExhausted`.
    fn transition(
        &self,
        job_id: Uuid,
        transition: Transition,
    ) -> impl Future<Output = Result<Job, AppError>> + Send;

    fn get(&self, job_id: Uuid) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    /// Most recent jobs first.
    fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Job>, AppError>> + Send;

    fn count_by_status(
        &self,
        status: JobStatus,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Delete terminal jobs last updated before `cutoff`.
    fn purge_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// In-process job store.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the map lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job store mutex");
            poisoned.into_inner()
        })
    }
}

impl JobStore for MemoryJobStore {
    async fn create(&self, request: NewJob) -> Result<Job, AppError> {
        let job = Job::from_request(request, Utc::now());
        self.lock_inner().insert(job.id, job.clone());
        Ok(job)
    }

    async fn record_cached(
        &self,
        request: NewJob,
        result: Vec<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<Job, AppError> {
        let job = Job::cached(request, result, completed_at, Utc::now());
        self.lock_inner().insert(job.id, job.clone());
        Ok(job)
    }

    async fn transition(&self, job_id: Uuid, transition: Transition) -> Result<Job, AppError> {
        let mut jobs = self.lock_inner();
        let job = jobs.get_mut(&job_id).ok_or(AppError::NotFound(job_id))?;
        job.apply(transition, Utc::now())?;
        Ok(job.clone())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        Ok(self.lock_inner().get(&job_id).cloned())
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, AppError> {
        let jobs = self.lock_inner();
        let mut filtered: Vec<Job> = jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        filtered.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        filtered.truncate(limit);
        Ok(filtered)
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, AppError> {
        let jobs = self.lock_inner();
        Ok(jobs.values().filter(|j| j.status == status).count() as u64)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let mut jobs = self.lock_inner();
        let before = jobs.len();
        jobs.retain(|_, j| !(j.status.is_terminal() && j.updated_at < cutoff));
        Ok((before - jobs.len()) as u64)
    }
}
