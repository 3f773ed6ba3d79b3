//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::admission::QuotaLedger;
use crate::broker::{Delivery, MessageBroker};
use crate::cache::{CacheStore, CounterState};
use crate::error::AppError;
use crate::job::{Job, NewJob, Priority, QueueMessage, Store};
use crate::scraper::{ScrapeError, Scraper};
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// MockScraper
// ---------------------------------------------------------------------------

/// Mock scraper that plays back scripted responses.
#[derive(Clone)]
pub struct MockScraper {
    /// Each call pops the front element. When empty, `fallback` is returned.
    responses: Arc<Mutex<VecDeque<Result<Vec<String>, ScrapeError>>>>,
    fallback: Option<Vec<String>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockScraper {
    pub fn new(responses: Vec<Result<Vec<String>, ScrapeError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            fallback: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Scraper that always succeeds with `urls`.
    pub fn always(urls: Vec<String>) -> Self {
        Self {
            fallback: Some(urls),
            ..Self::new(vec![])
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// App ids passed to `scrape`, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Scraper for MockScraper {
    async fn scrape(&self, app_id: &str) -> Result<Vec<String>, ScrapeError> {
        self.calls.lock().unwrap().push(app_id.to_string());
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(response) => response,
            None => match &self.fallback {
                Some(urls) => Ok(urls.clone()),
                None => Err(ScrapeError::permanent("no scripted response left")),
            },
        }
    }
}

/// Scraper that sleeps before answering, for timeout and lease tests.
#[derive(Clone)]
pub struct SlowScraper {
    delay: Duration,
    response: Result<Vec<String>, ScrapeError>,
    calls: Arc<Mutex<usize>>,
}

impl SlowScraper {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            response: Ok(vec!["https://img/slow.png".to_string()]),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Sleeps, then fails with `error`.
    pub fn failing(delay: Duration, error: ScrapeError) -> Self {
        Self {
            response: Err(error),
            ..Self::new(delay)
        }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl Scraper for SlowScraper {
    async fn scrape(&self, _app_id: &str) -> Result<Vec<String>, ScrapeError> {
        *self.calls.lock().unwrap() += 1;
        tokio::time::sleep(self.delay).await;
        self.response.clone()
    }
}

// ---------------------------------------------------------------------------
// FailingCache
// ---------------------------------------------------------------------------

/// Cache whose every operation reports an outage.
#[derive(Debug, Clone, Copy)]
pub struct FailingCache;

fn cache_down() -> AppError {
    AppError::CacheUnavailable("connection refused".to_string())
}

impl CacheStore for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, AppError> {
        Err(cache_down())
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), AppError> {
        Err(cache_down())
    }

    async fn delete(&self, _key: &str) -> Result<bool, AppError> {
        Err(cache_down())
    }

    async fn exists(&self, _key: &str) -> Result<bool, AppError> {
        Err(cache_down())
    }

    async fn increment(&self, _key: &str, _amount: u64) -> Result<u64, AppError> {
        Err(cache_down())
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, AppError> {
        Err(cache_down())
    }

    async fn ttl(&self, _key: &str) -> Result<Option<Duration>, AppError> {
        Err(cache_down())
    }

    async fn increment_with_ttl(
        &self,
        _key: &str,
        _amount: u64,
        _ttl: Duration,
    ) -> Result<CounterState, AppError> {
        Err(cache_down())
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        Err(cache_down())
    }
}

// ---------------------------------------------------------------------------
// FailingBroker
// ---------------------------------------------------------------------------

/// Broker that refuses every operation.
#[derive(Debug, Clone, Copy)]
pub struct FailingBroker;

fn broker_down() -> AppError {
    AppError::BrokerUnavailable("broker unreachable".to_string())
}

impl MessageBroker for FailingBroker {
    async fn publish(
        &self,
        _queue: &str,
        _message: &QueueMessage,
        _priority: Priority,
        _delay: Duration,
    ) -> Result<Uuid, AppError> {
        Err(broker_down())
    }

    async fn claim(&self, _queue: &str, _consumer: &str) -> Result<Option<Delivery>, AppError> {
        Err(broker_down())
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<bool, AppError> {
        Err(broker_down())
    }

    async fn reschedule(
        &self,
        _delivery: &Delivery,
        _attempt: u32,
        _delay: Duration,
    ) -> Result<bool, AppError> {
        Err(broker_down())
    }

    async fn depth(&self, _queue: &str) -> Result<u64, AppError> {
        Err(broker_down())
    }
}

// ---------------------------------------------------------------------------
// FixedLedger
// ---------------------------------------------------------------------------

/// Ledger with a single shared balance for every client.
#[derive(Clone)]
pub struct FixedLedger {
    balance: Arc<Mutex<u64>>,
}

impl FixedLedger {
    pub fn new(balance: Arc<Mutex<u64>>) -> Self {
        Self { balance }
    }
}

impl QuotaLedger for FixedLedger {
    async fn try_consume(&self, _client_id: &str, amount: u64) -> Result<bool, AppError> {
        let mut balance = self.balance.lock().unwrap();
        if *balance >= amount {
            *balance -= amount;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn refund(&self, _client_id: &str, amount: u64) -> Result<(), AppError> {
        *self.balance.lock().unwrap() += amount;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock worker reporter that records events.
#[derive(Default, Clone)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let label = match &event {
            WorkerEvent::Started { .. } => "Started",
            WorkerEvent::Polling => "Polling",
            WorkerEvent::MessageClaimed { .. } => "MessageClaimed",
            WorkerEvent::JobStarted { .. } => "JobStarted",
            WorkerEvent::JobSkipped { .. } => "JobSkipped",
            WorkerEvent::JobDeferred { .. } => "JobDeferred",
            WorkerEvent::JobCompleted { .. } => "JobCompleted",
            WorkerEvent::JobFailed { .. } => "JobFailed",
            WorkerEvent::ShuttingDown { .. } => "ShuttingDown",
            WorkerEvent::Stopped { .. } => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Create a pending Play Store job for testing.
pub fn make_test_job() -> Job {
    Job::from_request(
        NewJob::new("com.example.app", Store::PlayStore, "test-client"),
        Utc::now(),
    )
}
