pub mod admission;
pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod job;
pub mod job_store;
pub mod retry;
pub mod router;
pub mod scraper;
pub mod service;
pub mod sweeper;
pub mod testutil;
pub mod warming;
pub mod worker;

pub use admission::{Admission, AdmissionController, QuotaLedger, QuotaPolicy, Tier, TierQuota, Unmetered};
pub use broker::{Delivery, MemoryBroker, MessageBroker};
pub use cache::{CacheKey, CacheStore, CacheTtls, CounterState, MemoryCache, ScrapeMetadata, ScreenshotCache};
pub use config::RuntimeConfig;
pub use error::AppError;
pub use job::{Job, JobStatus, JobStatusReport, NewJob, Priority, QueueMessage, Store, Transition};
pub use job_store::{JobStore, MemoryJobStore};
pub use retry::{NextAction, RetryPolicy, ScrapeOutcome};
pub use router::{JobRouter, queue_for};
pub use scraper::{ScrapeError, Scraper, ScraperRegistry};
pub use service::{BatchItem, QueueStats, ScreenshotService, SubmitRequest, SubmitResponse};
pub use sweeper::{MaintenanceSweeper, SweepReport, SweeperConfig};
pub use warming::{WarmReport, WarmTarget};
pub use worker::{PoolConfig, TracingWorkerReporter, WorkerPool, WorkerReporter, WorkerService};
