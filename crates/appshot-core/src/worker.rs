use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::broker::{Delivery, MessageBroker};
use crate::cache::{CacheStore, ScrapeMetadata, ScreenshotCache};
use crate::error::AppError;
use crate::job::{Job, JobStatus, QueueMessage, Store, Transition};
use crate::job_store::JobStore;
use crate::retry::{NextAction, RetryPolicy, ScrapeOutcome};
use crate::router::queue_for;
use crate::scraper::{Scraper, ScraperRegistry};

/// Minimum slack between the scrape timeout and the broker's visibility
/// timeout. Also how long a scrape lock outlives the scrape it guards.
pub const LEASE_MARGIN: Duration = Duration::from_secs(30);

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
        store: Store,
    },
    Polling,
    MessageClaimed {
        delivery: &'a Delivery,
    },
    JobStarted {
        job_id: Uuid,
        app_id: &'a str,
        attempt: u32,
    },
    JobSkipped {
        job_id: Uuid,
        status: JobStatus,
    },
    /// Another worker is scraping the same app; the message was pushed back.
    JobDeferred {
        job_id: Uuid,
        delay: Duration,
    },
    JobCompleted {
        job_id: Uuid,
        screenshots: usize,
    },
    JobFailed {
        job_id: Uuid,
        error: &'a str,
        will_retry: bool,
    },
    ShuttingDown {
        worker_id: &'a str,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id, store } => {
                tracing::info!(%worker_id, %store, "Worker started");
            }
            WorkerEvent::Polling => {
                tracing::trace!("Polling for messages");
            }
            WorkerEvent::MessageClaimed { delivery } => {
                tracing::debug!(
                    delivery_id = %delivery.id,
                    job_id = %delivery.message.job_id,
                    delivery_count = delivery.delivery_count,
                    "Message claimed"
                );
            }
            WorkerEvent::JobStarted {
                job_id,
                app_id,
                attempt,
            } => {
                tracing::info!(%job_id, %app_id, %attempt, "Processing job");
            }
            WorkerEvent::JobSkipped { job_id, status } => {
                tracing::info!(%job_id, %status, "Skipping redelivered job");
            }
            WorkerEvent::JobDeferred { job_id, delay } => {
                tracing::debug!(%job_id, ?delay, "App already being scraped, deferring");
            }
            WorkerEvent::JobCompleted {
                job_id,
                screenshots,
            } => {
                tracing::info!(%job_id, %screenshots, "Job completed");
            }
            WorkerEvent::JobFailed {
                job_id,
                error,
                will_retry,
            } => {
                tracing::warn!(%job_id, %error, %will_retry, "Job failed");
            }
            WorkerEvent::ShuttingDown { worker_id } => {
                tracing::info!(%worker_id, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// Configuration for a single worker task.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub scrape_timeout: Duration,
    /// How long to push a message back while its app is locked.
    pub lock_retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            poll_interval: Duration::from_secs(1),
            scrape_timeout: Duration::from_secs(60),
            lock_retry_delay: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_scrape_timeout(mut self, timeout: Duration) -> Self {
        self.scrape_timeout = timeout;
        self
    }

    pub fn with_lock_retry_delay(mut self, delay: Duration) -> Self {
        self.lock_retry_delay = delay;
        self
    }
}

/// Worker that consumes one store's queue and runs its scraper.
pub struct WorkerService<J, B, C, S>
where
    J: JobStore,
    B: MessageBroker,
    C: CacheStore,
    S: Scraper,
{
    jobs: J,
    broker: B,
    cache: ScreenshotCache<C>,
    scraper: S,
    store: Store,
    policy: RetryPolicy,
    config: WorkerConfig,
}

impl<J, B, C, S> WorkerService<J, B, C, S>
where
    J: JobStore,
    B: MessageBroker,
    C: CacheStore,
    S: Scraper,
{
    pub fn new(
        jobs: J,
        broker: B,
        cache: ScreenshotCache<C>,
        scraper: S,
        store: Store,
        policy: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        Self {
            jobs,
            broker,
            cache,
            scraper,
            store,
            policy,
            config,
        }
    }

    /// Run the worker loop until cancellation.
    ///
    /// A delivery being processed when the token fires is finished first.
    pub async fn run<WR: WorkerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) -> Result<(), AppError> {
        reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
            store: self.store,
        });
        let queue = queue_for(self.store);

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            reporter.report(WorkerEvent::Polling);

            match self.broker.claim(queue, &self.config.worker_id).await {
                Ok(Some(delivery)) => {
                    reporter.report(WorkerEvent::MessageClaimed {
                        delivery: &delivery,
                    });
                    if let Err(e) = self.process_delivery(&delivery, reporter).await {
                        // Left unacked; the broker redelivers it after the
                        // visibility timeout.
                        tracing::error!(
                            delivery_id = %delivery.id,
                            job_id = %delivery.message.job_id,
                            error = %e,
                            "Failed to process delivery"
                        );
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(%queue, error = %e, "Failed to claim message");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        reporter.report(WorkerEvent::ShuttingDown {
            worker_id: &self.config.worker_id,
        });
        reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
        });

        Ok(())
    }

    /// Handle one delivery end to end.
    ///
    /// Returns an error only when the outcome could not be recorded; the
    /// message is then left unacknowledged.
    pub async fn process_delivery<WR: WorkerReporter>(
        &self,
        delivery: &Delivery,
        reporter: &WR,
    ) -> Result<(), AppError> {
        let message = &delivery.message;

        let Some(job) = self.jobs.get(message.job_id).await? else {
            tracing::warn!(job_id = %message.job_id, "Message references unknown job, dropping");
            self.ack(delivery).await;
            return Ok(());
        };

        if job.status.is_terminal() {
            reporter.report(WorkerEvent::JobSkipped {
                job_id: job.id,
                status: job.status,
            });
            self.ack(delivery).await;
            return Ok(());
        }

        // A job submitted while an identical one was still queued finds the
        // earlier result here.
        if !message.force_refresh {
            if let Some(result) = self.cache.get_screenshots(job.store, &job.app_id).await {
                return self.run_attempt(delivery, job, Some(result), reporter).await;
            }
        }

        let (store, app_id) = (job.store, job.app_id.clone());
        let lock_ttl = self.config.scrape_timeout.saturating_add(LEASE_MARGIN);
        if !self.cache.try_lock_scrape(store, &app_id, lock_ttl).await {
            let delay = self.config.lock_retry_delay;
            reporter.report(WorkerEvent::JobDeferred {
                job_id: job.id,
                delay,
            });
            self.broker.reschedule(delivery, message.attempt, delay).await?;
            return Ok(());
        }

        let cached = if message.force_refresh {
            None
        } else {
            // The lock holder we waited on may have just stored a result.
            self.cache.get_screenshots(store, &app_id).await
        };
        let settled = self.run_attempt(delivery, job, cached, reporter).await;
        self.cache.unlock_scrape(store, &app_id).await;
        settled
    }

    /// Run one attempt for a claimed, non-terminal job and settle it. A
    /// `cached` result completes the job without scraping.
    async fn run_attempt<WR: WorkerReporter>(
        &self,
        delivery: &Delivery,
        job: Job,
        cached: Option<Vec<String>>,
        reporter: &WR,
    ) -> Result<(), AppError> {
        let job = match self.begin_attempt(job).await {
            Ok(job) => job,
            Err(AppError::AttemptsExhausted {
                job_id,
                max_attempts,
            }) => {
                let error = format!("Gave up after {max_attempts} attempts");
                reporter.report(WorkerEvent::JobFailed {
                    job_id,
                    error: &error,
                    will_retry: false,
                });
                self.settle(job_id, Transition::Fail { error }).await?;
                self.ack(delivery).await;
                return Ok(());
            }
            Err(AppError::StateConflict { job_id, from, to }) => {
                tracing::warn!(%job_id, %from, %to, "Job moved underneath us, dropping message");
                self.ack(delivery).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        reporter.report(WorkerEvent::JobStarted {
            job_id: job.id,
            app_id: &job.app_id,
            attempt: job.attempt_count,
        });

        let from_cache = cached.is_some();
        let outcome = match cached {
            Some(result) => {
                tracing::info!(job_id = %job.id, app_id = %job.app_id, "Result cached since submission, skipping scrape");
                ScrapeOutcome::Success(result)
            }
            None => self.scrape(&job.app_id).await,
        };
        let action = self
            .policy
            .next_action(job.attempt_count, job.max_attempts, outcome);

        match action {
            NextAction::Complete { result } => {
                let screenshots = result.len();
                let settled = self
                    .settle(job.id, Transition::Complete { result: result.clone() })
                    .await?;
                if settled.is_none() {
                    return self.release_after_conflict(delivery, job.id).await;
                }
                if !from_cache {
                    let metadata = ScrapeMetadata {
                        screenshot_count: screenshots,
                        scraped_at: Utc::now(),
                        job_id: job.id,
                    };
                    self.cache
                        .put_result(job.store, &job.app_id, &result, &metadata)
                        .await;
                }
                reporter.report(WorkerEvent::JobCompleted {
                    job_id: job.id,
                    screenshots,
                });
                self.ack(delivery).await;
            }
            NextAction::Retry {
                attempt,
                delay,
                error,
            } => {
                reporter.report(WorkerEvent::JobFailed {
                    job_id: job.id,
                    error: &error,
                    will_retry: true,
                });
                if self.settle(job.id, Transition::Retry { error }).await?.is_none() {
                    return self.release_after_conflict(delivery, job.id).await;
                }
                tracing::debug!(job_id = %job.id, ?delay, %attempt, "Retry scheduled");
                self.requeue(delivery, attempt, delay).await?;
            }
            NextAction::Fail { error } => {
                reporter.report(WorkerEvent::JobFailed {
                    job_id: job.id,
                    error: &error,
                    will_retry: false,
                });
                if self.settle(job.id, Transition::Fail { error }).await?.is_none() {
                    return self.release_after_conflict(delivery, job.id).await;
                }
                self.ack(delivery).await;
            }
        }

        Ok(())
    }

    /// Bring a claimed job to `processing`, counting a new attempt unless a
    /// crashed worker already started this one.
    async fn begin_attempt(&self, job: Job) -> Result<Job, AppError> {
        match job.status {
            JobStatus::Processing => {
                tracing::warn!(job_id = %job.id, attempt = job.attempt_count, "Resuming job left in processing");
                Ok(job)
            }
            JobStatus::Pending | JobStatus::Retrying => {
                self.jobs.transition(job.id, Transition::Queue).await?;
                self.jobs.transition(job.id, Transition::Start).await
            }
            _ => self.jobs.transition(job.id, Transition::Start).await,
        }
    }

    async fn scrape(&self, app_id: &str) -> ScrapeOutcome {
        let timeout = self.config.scrape_timeout;
        match tokio::time::timeout(timeout, self.scraper.scrape(app_id)).await {
            Ok(result) => result.into(),
            Err(_) => ScrapeOutcome::RetryableFailure(AppError::Timeout(timeout.as_secs()).to_string()),
        }
    }

    /// Apply a final transition for this attempt. A conflict means another
    /// delivery of the same message already settled the job.
    async fn settle(&self, job_id: Uuid, transition: Transition) -> Result<Option<Job>, AppError> {
        match self.jobs.transition(job_id, transition).await {
            Ok(job) => Ok(Some(job)),
            Err(AppError::StateConflict { from, to, .. }) => {
                tracing::warn!(%job_id, %from, %to, "Job already settled by another delivery");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Another delivery settled the job first. Only a terminal job lets go of
    /// the message; a job still waiting to run keeps it for redelivery.
    async fn release_after_conflict(&self, delivery: &Delivery, job_id: Uuid) -> Result<(), AppError> {
        match self.jobs.get(job_id).await? {
            Some(job) if !job.status.is_terminal() => {
                tracing::debug!(%job_id, status = %job.status, "Keeping message for job still in flight");
            }
            _ => self.ack(delivery).await,
        }
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, attempt: u32, delay: Duration) -> Result<(), AppError> {
        if self.broker.reschedule(delivery, attempt, delay).await? {
            return Ok(());
        }
        // Our lease expired or the message was acked elsewhere; publish afresh.
        let message = QueueMessage {
            attempt,
            ..delivery.message.clone()
        };
        self.broker
            .publish(&delivery.queue, &message, delivery.priority, delay)
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) {
        match self.broker.ack(delivery).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(delivery_id = %delivery.id, "Lease expired before ack, leaving message");
            }
            Err(e) => {
                tracing::error!(delivery_id = %delivery.id, error = %e, "Failed to ack message");
            }
        }
    }
}

/// Size and timing of the per-store worker pools.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers_per_store: usize,
    pub poll_interval: Duration,
    pub scrape_timeout: Duration,
    pub lock_retry_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers_per_store: 4,
            poll_interval: Duration::from_secs(1),
            scrape_timeout: Duration::from_secs(60),
            lock_retry_delay: Duration::from_secs(5),
        }
    }
}

/// A fixed set of worker tasks, `workers_per_store` for every registered
/// store.
pub struct WorkerPool {
    tracker: TaskTracker,
    cancel_token: CancellationToken,
    workers: usize,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn<J, B, C, S, WR>(
        registry: &ScraperRegistry<S>,
        jobs: J,
        broker: B,
        cache: ScreenshotCache<C>,
        policy: RetryPolicy,
        config: PoolConfig,
        reporter: WR,
        cancel_token: CancellationToken,
    ) -> Result<Self, AppError>
    where
        J: JobStore + 'static,
        B: MessageBroker + 'static,
        C: CacheStore + 'static,
        S: Scraper + 'static,
        WR: WorkerReporter + Clone + 'static,
    {
        let tracker = TaskTracker::new();
        let mut workers = 0;

        for store in registry.stores() {
            let scraper = registry.scraper_for(store)?;
            for n in 0..config.workers_per_store {
                let worker = WorkerService::new(
                    jobs.clone(),
                    broker.clone(),
                    cache.clone(),
                    scraper.clone(),
                    store,
                    policy.clone(),
                    WorkerConfig::default()
                        .with_worker_id(format!("{store}-{n}"))
                        .with_poll_interval(config.poll_interval)
                        .with_scrape_timeout(config.scrape_timeout)
                        .with_lock_retry_delay(config.lock_retry_delay),
                );
                let token = cancel_token.child_token();
                let reporter = reporter.clone();
                tracker.spawn(async move {
                    if let Err(e) = worker.run(token, &reporter).await {
                        tracing::error!(error = %e, "Worker exited with error");
                    }
                });
                workers += 1;
            }
        }
        tracker.close();

        Ok(Self {
            tracker,
            cancel_token,
            workers,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Stop claiming new messages and wait for in-flight jobs to settle.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        self.tracker.wait().await;
    }
}
