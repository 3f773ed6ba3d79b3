//! Runtime-selected backends.
//!
//! Deployments pick in-process or shared storage from configuration, while the
//! core services stay generic over one concrete type per concern.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use appshot_core::broker::{Delivery, MemoryBroker, MessageBroker};
use appshot_core::cache::{CacheStore, CounterState, MemoryCache};
use appshot_core::error::AppError;
use appshot_core::job::{Job, JobStatus, NewJob, Priority, QueueMessage, Transition};
use appshot_core::job_store::{JobStore, MemoryJobStore};

use crate::config::{DatabaseConfig, RedisConfig};
use crate::database::Database;
use crate::job_repository::JobRepository;
use crate::queue_repository::QueueRepository;
use crate::redis_cache::RedisCache;

macro_rules! dispatch {
    ($self:ident, $Enum:ident { $($Variant:ident),+ }, $inner:ident => $call:expr) => {
        match $self {
            $($Enum::$Variant($inner) => $call.await,)+
        }
    };
}

#[derive(Clone)]
pub enum CacheBackend {
    Memory(MemoryCache),
    Redis(RedisCache),
}

impl CacheBackend {
    pub fn name(&self) -> &'static str {
        match self {
            CacheBackend::Memory(_) => "memory",
            CacheBackend::Redis(_) => "redis",
        }
    }
}

impl CacheStore for CacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        dispatch!(self, CacheBackend { Memory, Redis }, c => c.get(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), AppError> {
        dispatch!(self, CacheBackend { Memory, Redis }, c => c.set(key, value, ttl))
    }

    async fn delete(&self, key: &str) -> Result<bool, AppError> {
        dispatch!(self, CacheBackend { Memory, Redis }, c => c.delete(key))
    }

    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        dispatch!(self, CacheBackend { Memory, Redis }, c => c.exists(key))
    }

    async fn increment(&self, key: &str, amount: u64) -> Result<u64, AppError> {
        dispatch!(self, CacheBackend { Memory, Redis }, c => c.increment(key, amount))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, AppError> {
        dispatch!(self, CacheBackend { Memory, Redis }, c => c.expire(key, ttl))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, AppError> {
        dispatch!(self, CacheBackend { Memory, Redis }, c => c.ttl(key))
    }

    async fn increment_with_ttl(
        &self,
        key: &str,
        amount: u64,
        ttl: Duration,
    ) -> Result<CounterState, AppError> {
        dispatch!(self, CacheBackend { Memory, Redis }, c => c.increment_with_ttl(key, amount, ttl))
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        dispatch!(self, CacheBackend { Memory, Redis }, c => c.purge_expired())
    }
}

#[derive(Clone)]
pub enum JobBackend {
    Memory(MemoryJobStore),
    Postgres(JobRepository),
}

impl JobBackend {
    pub fn name(&self) -> &'static str {
        match self {
            JobBackend::Memory(_) => "memory",
            JobBackend::Postgres(_) => "postgres",
        }
    }
}

impl JobStore for JobBackend {
    async fn create(&self, request: NewJob) -> Result<Job, AppError> {
        dispatch!(self, JobBackend { Memory, Postgres }, s => s.create(request))
    }

    async fn record_cached(
        &self,
        request: NewJob,
        result: Vec<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<Job, AppError> {
        dispatch!(self, JobBackend { Memory, Postgres }, s => s.record_cached(request, result, completed_at))
    }

    async fn transition(&self, job_id: Uuid, transition: Transition) -> Result<Job, AppError> {
        dispatch!(self, JobBackend { Memory, Postgres }, s => s.transition(job_id, transition))
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        dispatch!(self, JobBackend { Memory, Postgres }, s => s.get(job_id))
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, AppError> {
        dispatch!(self, JobBackend { Memory, Postgres }, s => s.list(status, limit))
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, AppError> {
        dispatch!(self, JobBackend { Memory, Postgres }, s => s.count_by_status(status))
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        dispatch!(self, JobBackend { Memory, Postgres }, s => s.purge_terminal_before(cutoff))
    }
}

#[derive(Clone)]
pub enum BrokerBackend {
    Memory(MemoryBroker),
    Postgres(QueueRepository),
}

impl BrokerBackend {
    pub fn name(&self) -> &'static str {
        match self {
            BrokerBackend::Memory(_) => "memory",
            BrokerBackend::Postgres(_) => "postgres",
        }
    }
}

impl MessageBroker for BrokerBackend {
    async fn publish(
        &self,
        queue: &str,
        message: &QueueMessage,
        priority: Priority,
        delay: Duration,
    ) -> Result<Uuid, AppError> {
        dispatch!(self, BrokerBackend { Memory, Postgres }, b => b.publish(queue, message, priority, delay))
    }

    async fn claim(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>, AppError> {
        dispatch!(self, BrokerBackend { Memory, Postgres }, b => b.claim(queue, consumer))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, AppError> {
        dispatch!(self, BrokerBackend { Memory, Postgres }, b => b.ack(delivery))
    }

    async fn reschedule(
        &self,
        delivery: &Delivery,
        attempt: u32,
        delay: Duration,
    ) -> Result<bool, AppError> {
        dispatch!(self, BrokerBackend { Memory, Postgres }, b => b.reschedule(delivery, attempt, delay))
    }

    async fn depth(&self, queue: &str) -> Result<u64, AppError> {
        dispatch!(self, BrokerBackend { Memory, Postgres }, b => b.depth(queue))
    }
}

/// The three storage concerns, chosen once at startup.
#[derive(Clone)]
pub struct Backends {
    pub cache: CacheBackend,
    pub jobs: JobBackend,
    pub broker: BrokerBackend,
}

impl Backends {
    /// Single-process deployment: moka cache, in-memory jobs and queue.
    pub fn in_memory(visibility_timeout: Duration) -> Self {
        Self {
            cache: CacheBackend::Memory(MemoryCache::default()),
            jobs: JobBackend::Memory(MemoryJobStore::new()),
            broker: BrokerBackend::Memory(MemoryBroker::new(visibility_timeout)),
        }
    }

    /// PostgreSQL for jobs and queue when `database` is given, Redis for the
    /// cache when `redis` is given; in-process otherwise. Runs migrations.
    pub async fn connect(
        database: Option<&DatabaseConfig>,
        redis: Option<&RedisConfig>,
        visibility_timeout: Duration,
    ) -> Result<Self, AppError> {
        let mut backends = Self::in_memory(visibility_timeout);

        if let Some(config) = database {
            let db = Database::connect(config).await?;
            db.migrate().await?;
            backends.jobs = JobBackend::Postgres(db.job_repo());
            backends.broker = BrokerBackend::Postgres(
                db.queue_repo().with_visibility_timeout(visibility_timeout),
            );
        }
        if let Some(config) = redis {
            backends.cache = CacheBackend::Redis(RedisCache::connect(&config.url).await?);
        }

        tracing::info!(
            cache = backends.cache.name(),
            jobs = backends.jobs.name(),
            broker = backends.broker.name(),
            "Storage backends ready"
        );
        Ok(backends)
    }

    /// True when jobs and queue live only in this process.
    pub fn is_process_local(&self) -> bool {
        matches!(self.broker, BrokerBackend::Memory(_))
    }
}
