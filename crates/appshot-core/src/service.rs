//! Entry points used by the HTTP server and CLI.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::admission::{
    AdmissionController, ENDPOINT_BATCH, ENDPOINT_SCRAPE, QuotaLedger, Tier, Unmetered,
};
use crate::broker::MessageBroker;
use crate::cache::{CacheStore, ScreenshotCache};
use crate::error::AppError;
use crate::job::{Job, JobStatus, JobStatusReport, Priority, Store};
use crate::job_store::JobStore;
use crate::router::{JobRouter, queue_for};
use crate::warming::{WarmReport, WarmTarget};

/// Largest accepted batch.
pub const MAX_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub app_id: String,
    pub store: String,
    pub client_id: String,
    pub tier: Option<String>,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub from_cache: bool,
}

impl From<&Job> for SubmitResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            from_cache: job.from_cache,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchItem {
    pub app_id: String,
    pub store: String,
}

/// Queue depth per store and job counts per status.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue_depth: BTreeMap<String, u64>,
    pub jobs: BTreeMap<String, u64>,
}

/// Facade over admission, routing and the job store.
#[derive(Clone)]
pub struct ScreenshotService<C, J, B, L = Unmetered>
where
    C: CacheStore,
    J: JobStore,
    B: MessageBroker,
    L: QuotaLedger,
{
    admission: AdmissionController<C>,
    cache: ScreenshotCache<C>,
    router: JobRouter<C, J, B>,
    jobs: J,
    broker: B,
    ledger: L,
}

impl<C, J, B> ScreenshotService<C, J, B, Unmetered>
where
    C: CacheStore,
    J: JobStore,
    B: MessageBroker,
{
    pub fn new(
        admission: AdmissionController<C>,
        cache: ScreenshotCache<C>,
        router: JobRouter<C, J, B>,
        jobs: J,
        broker: B,
    ) -> Self {
        Self {
            admission,
            cache,
            router,
            jobs,
            broker,
            ledger: Unmetered,
        }
    }
}

impl<C, J, B, L> ScreenshotService<C, J, B, L>
where
    C: CacheStore,
    J: JobStore,
    B: MessageBroker,
    L: QuotaLedger,
{
    /// Swap in an account-balance ledger checked after rate limiting.
    pub fn with_ledger<L2: QuotaLedger>(self, ledger: L2) -> ScreenshotService<C, J, B, L2> {
        ScreenshotService {
            admission: self.admission,
            cache: self.cache,
            router: self.router,
            jobs: self.jobs,
            broker: self.broker,
            ledger,
        }
    }

    pub fn admission(&self) -> &AdmissionController<C> {
        &self.admission
    }

    /// Validate, admit and route a single submission.
    pub async fn submit_job(&self, request: SubmitRequest) -> Result<SubmitResponse, AppError> {
        let store = parse_and_validate(&request.store, &request.app_id)?;
        let tier = Tier::resolve(request.tier.as_deref());

        self.admission
            .check_and_admit(&request.client_id, ENDPOINT_SCRAPE, tier)
            .await
            .into_result()?;
        self.charge(&request.client_id, 1).await?;

        let submitted = self
            .router
            .submit(
                &request.app_id,
                store,
                &request.client_id,
                request.force_refresh,
                Priority::Interactive,
            )
            .await;
        match submitted {
            Ok(job) => Ok(SubmitResponse::from(&job)),
            Err(e) => {
                self.refund(&request.client_id, 1).await;
                Err(e)
            }
        }
    }

    /// Status of a job. With `client_id`, jobs owned by someone else are
    /// reported as not found.
    pub async fn get_job_status(
        &self,
        job_id: Uuid,
        client_id: Option<&str>,
    ) -> Result<JobStatusReport, AppError> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .filter(|job| client_id.is_none_or(|c| job.client_id == c))
            .ok_or(AppError::NotFound(job_id))?;
        Ok(JobStatusReport::from(job))
    }

    /// Submit up to [`MAX_BATCH_SIZE`] apps at batch priority.
    ///
    /// Every item is validated before anything is charged or enqueued.
    pub async fn batch_submit(
        &self,
        items: Vec<BatchItem>,
        client_id: &str,
        tier: Option<&str>,
        force_refresh: bool,
    ) -> Result<Vec<SubmitResponse>, AppError> {
        let tier = Tier::resolve(tier);
        if !tier.allows_batch() {
            return Err(AppError::TierForbidden {
                tier: tier.to_string(),
                operation: "batch submission".to_string(),
            });
        }
        if items.is_empty() {
            return Err(AppError::ValidationError("Batch is empty".to_string()));
        }
        if items.len() > MAX_BATCH_SIZE {
            return Err(AppError::ValidationError(format!(
                "Batch of {} exceeds the limit of {MAX_BATCH_SIZE}",
                items.len()
            )));
        }

        let validated = items
            .iter()
            .map(|item| parse_and_validate(&item.store, &item.app_id).map(|s| (s, item)))
            .collect::<Result<Vec<_>, _>>()?;

        let cost = validated.len() as u64;
        self.admission
            .check_and_admit_n(client_id, ENDPOINT_BATCH, tier, cost)
            .await
            .into_result()?;
        self.charge(client_id, cost).await?;

        let mut responses = Vec::with_capacity(validated.len());
        for (store, item) in validated {
            let submitted = self
                .router
                .submit(&item.app_id, store, client_id, force_refresh, Priority::Batch)
                .await;
            match submitted {
                Ok(job) => responses.push(SubmitResponse::from(&job)),
                Err(e) => {
                    // Items already enqueued stay charged.
                    self.refund(client_id, cost - responses.len() as u64).await;
                    return Err(e);
                }
            }
        }
        tracing::info!(%client_id, count = responses.len(), "Batch submitted");
        Ok(responses)
    }

    /// Enqueue maintenance-priority scrapes for targets with nothing cached.
    ///
    /// Not admitted or charged; warming runs on the operator's behalf.
    pub async fn warm_cache(
        &self,
        targets: &[WarmTarget],
        client_id: &str,
    ) -> Result<WarmReport, AppError> {
        let mut report = WarmReport::default();
        for target in targets {
            if self
                .cache
                .get_screenshots(target.store, &target.app_id)
                .await
                .is_some()
            {
                tracing::debug!(%target, "Already cached, not warming");
                report.skipped.push(target.to_string());
                continue;
            }
            let job = self
                .router
                .submit(&target.app_id, target.store, client_id, false, Priority::Maintenance)
                .await?;
            report.queued.push(job.id);
        }
        tracing::info!(
            queued = report.queued.len(),
            skipped = report.skipped.len(),
            "Cache warming submitted"
        );
        Ok(report)
    }

    /// Drop cached results for an app so the next submission scrapes again.
    pub async fn invalidate(&self, store: &str, app_id: &str) -> Result<u32, AppError> {
        let store = parse_and_validate(store, app_id)?;
        let removed = self.cache.invalidate(store, app_id).await?;
        tracing::info!(%store, %app_id, %removed, "Cache invalidated");
        Ok(removed)
    }

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, AppError> {
        self.jobs.list(status, limit).await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, AppError> {
        let mut queue_depth = BTreeMap::new();
        for store in Store::ALL {
            let depth = self.broker.depth(queue_for(store)).await?;
            queue_depth.insert(store.to_string(), depth);
        }
        let mut jobs = BTreeMap::new();
        for status in JobStatus::ALL {
            jobs.insert(status.to_string(), self.jobs.count_by_status(status).await?);
        }
        Ok(QueueStats { queue_depth, jobs })
    }

    async fn charge(&self, client_id: &str, amount: u64) -> Result<(), AppError> {
        if self.ledger.try_consume(client_id, amount).await? {
            Ok(())
        } else {
            Err(AppError::QuotaExhausted(client_id.to_string()))
        }
    }

    /// Give back balance charged for work that was never enqueued.
    async fn refund(&self, client_id: &str, amount: u64) {
        if let Err(e) = self.ledger.refund(client_id, amount).await {
            tracing::error!(%client_id, %amount, error = %e, "Failed to refund quota");
        }
    }
}

fn parse_and_validate(store: &str, app_id: &str) -> Result<Store, AppError> {
    let store: Store = store.parse()?;
    store.validate_app_id(app_id)?;
    Ok(store)
}
