use std::time::Duration;

use chrono::Utc;

use crate::broker::MessageBroker;
use crate::cache::{CacheStore, ScreenshotCache};
use crate::error::AppError;
use crate::job::{DEFAULT_MAX_ATTEMPTS, Job, NewJob, Priority, QueueMessage, Store, Transition};
use crate::job_store::JobStore;

/// Name of the queue that carries jobs for `store`.
pub fn queue_for(store: Store) -> &'static str {
    match store {
        Store::PlayStore => "screenshots.playstore",
        Store::AppStore => "screenshots.appstore",
    }
}

/// Turns submissions into queued jobs, short-circuiting on cache hits.
#[derive(Clone)]
pub struct JobRouter<C, J, B>
where
    C: CacheStore,
    J: JobStore,
    B: MessageBroker,
{
    cache: ScreenshotCache<C>,
    jobs: J,
    broker: B,
    max_attempts: u32,
}

impl<C, J, B> JobRouter<C, J, B>
where
    C: CacheStore,
    J: JobStore,
    B: MessageBroker,
{
    pub fn new(cache: ScreenshotCache<C>, jobs: J, broker: B) -> Self {
        Self {
            cache,
            jobs,
            broker,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Create and enqueue a job, or return a completed one from cache.
    ///
    /// The caller is expected to have validated `app_id` and admitted the
    /// request already.
    pub async fn submit(
        &self,
        app_id: &str,
        store: Store,
        client_id: &str,
        force_refresh: bool,
        priority: Priority,
    ) -> Result<Job, AppError> {
        let request = NewJob::new(app_id, store, client_id)
            .with_priority(priority)
            .with_max_attempts(self.max_attempts);

        if !force_refresh && let Some(result) = self.cache.get_screenshots(store, app_id).await {
            let completed_at = self
                .cache
                .get_metadata(store, app_id)
                .await
                .map(|m| m.scraped_at)
                .unwrap_or_else(Utc::now);
            let job = self.jobs.record_cached(request, result, completed_at).await?;
            tracing::info!(job_id = %job.id, %store, %app_id, "Served from cache");
            return Ok(job);
        }

        let job = self.jobs.create(request).await?;
        let job = self.jobs.transition(job.id, Transition::Queue).await?;

        let message = QueueMessage::for_job(&job).with_force_refresh(force_refresh);
        let queue = queue_for(store);
        match self
            .broker
            .publish(queue, &message, priority, Duration::ZERO)
            .await
        {
            Ok(delivery_id) => {
                tracing::info!(job_id = %job.id, %queue, %delivery_id, %priority, "Job enqueued");
                Ok(job)
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, %queue, error = %e, "Failed to publish job");
                let fail = Transition::Fail {
                    error: format!("Could not enqueue job: {e}"),
                };
                if let Err(mark_err) = self.jobs.transition(job.id, fail).await {
                    tracing::warn!(job_id = %job.id, error = %mark_err, "Failed to mark unpublished job as failed");
                }
                Err(match e {
                    AppError::BrokerUnavailable(_) => e,
                    other => AppError::BrokerUnavailable(other.to_string()),
                })
            }
        }
    }
}
