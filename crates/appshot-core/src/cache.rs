use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use moka::Expiry;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::Store;

/// Key/value store with per-entry TTL.
///
/// Implementations must make [`CacheStore::increment_with_ttl`] a single
/// atomic operation: the rate limiter relies on it instead of locks.
pub trait CacheStore: Send + Sync + Clone {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, AppError>> + Send;

    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Returns true if a live entry was removed.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Add `amount` to an integer counter, creating it (without TTL) if absent.
    fn increment(&self, key: &str, amount: u64)
    -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Set the TTL of an existing key. Returns false if the key is absent.
    fn expire(&self, key: &str, ttl: Duration)
    -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Remaining TTL, or `None` if the key is absent or never expires.
    fn ttl(&self, key: &str) -> impl Future<Output = Result<Option<Duration>, AppError>> + Send;

    /// Atomically increment a counter and apply `ttl` only if the key had
    /// none (i.e. the increment created it).
    fn increment_with_ttl(
        &self,
        key: &str,
        amount: u64,
        ttl: Duration,
    ) -> impl Future<Output = Result<CounterState, AppError>> + Send;

    /// Drop expired entries eagerly. Returns how many were removed, where the
    /// backend can tell.
    fn purge_expired(&self) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Counter value and remaining window after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    pub count: u64,
    pub ttl_remaining: Option<Duration>,
}

/// Cache key classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKey<'a> {
    Screenshots { store: Store, app_id: &'a str },
    Metadata { store: Store, app_id: &'a str },
    RateLimit { client_id: &'a str, endpoint: &'a str },
    /// Held by the worker currently scraping an app.
    ScrapeLock { store: Store, app_id: &'a str },
}

impl fmt::Display for CacheKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Screenshots { store, app_id } => write!(f, "screenshots:{store}:{app_id}"),
            CacheKey::Metadata { store, app_id } => write!(f, "metadata:{store}:{app_id}"),
            CacheKey::RateLimit {
                client_id,
                endpoint,
            } => write!(f, "ratelimit:{client_id}:{endpoint}"),
            CacheKey::ScrapeLock { store, app_id } => write!(f, "scrapelock:{store}:{app_id}"),
        }
    }
}

/// TTL classes for cached scrape results.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub screenshots: Duration,
    pub metadata: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            screenshots: Duration::from_secs(24 * 3600),
            metadata: Duration::from_secs(3600),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryCache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &Entry, created_at: Instant) -> Option<Duration> {
        value.remaining(created_at)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.remaining(updated_at)
    }
}

/// In-process cache backed by moka.
///
/// Moka evicts expired entries asynchronously, so every read also checks
/// `expires_at` itself.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Cache<String, Entry>,
}

impl MemoryCache {
    pub fn new(max_capacity: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry)
            .build();
        Self { inner }
    }

    async fn live_entry(&self, key: &str) -> Option<Entry> {
        self.inner
            .get(key)
            .await
            .filter(|entry| entry.is_live(Instant::now()))
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

fn parse_counter(key: &str, bytes: &[u8]) -> Result<u64, AppError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| AppError::CacheUnavailable(format!("value at '{key}' is not an integer")))
}

impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        Ok(self.live_entry(key).await.map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), AppError> {
        let entry = Entry {
            value,
            expires_at: Some(Instant::now() + ttl),
        };
        self.inner.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, AppError> {
        let removed = self.inner.remove(key).await;
        Ok(removed.is_some_and(|entry| entry.is_live(Instant::now())))
    }

    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        Ok(self.live_entry(key).await.is_some())
    }

    async fn increment(&self, key: &str, amount: u64) -> Result<u64, AppError> {
        let now = Instant::now();
        let result = self
            .inner
            .entry(key.to_string())
            .and_compute_with(|current| {
                let op = match current.map(|e| e.into_value()).filter(|e| e.is_live(now)) {
                    Some(entry) => match parse_counter(key, &entry.value) {
                        Ok(count) => Op::Put(Entry {
                            value: count.saturating_add(amount).to_string().into_bytes(),
                            expires_at: entry.expires_at,
                        }),
                        Err(_) => Op::Nop,
                    },
                    None => Op::Put(Entry {
                        value: amount.to_string().into_bytes(),
                        expires_at: None,
                    }),
                };
                std::future::ready(op)
            })
            .await;
        counter_from(key, result, now).map(|state| state.count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, AppError> {
        let now = Instant::now();
        let result = self
            .inner
            .entry(key.to_string())
            .and_compute_with(|current| {
                let op = match current.map(|e| e.into_value()).filter(|e| e.is_live(now)) {
                    Some(entry) => Op::Put(Entry {
                        value: entry.value,
                        expires_at: Some(now + ttl),
                    }),
                    None => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        Ok(matches!(result, CompResult::ReplacedWith(_)))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, AppError> {
        let now = Instant::now();
        Ok(self
            .live_entry(key)
            .await
            .and_then(|entry| entry.remaining(now)))
    }

    async fn increment_with_ttl(
        &self,
        key: &str,
        amount: u64,
        ttl: Duration,
    ) -> Result<CounterState, AppError> {
        let now = Instant::now();
        let result = self
            .inner
            .entry(key.to_string())
            .and_compute_with(|current| {
                let op = match current.map(|e| e.into_value()).filter(|e| e.is_live(now)) {
                    Some(entry) => match parse_counter(key, &entry.value) {
                        Ok(count) => Op::Put(Entry {
                            value: count.saturating_add(amount).to_string().into_bytes(),
                            expires_at: entry.expires_at.or(Some(now + ttl)),
                        }),
                        Err(_) => Op::Nop,
                    },
                    None => Op::Put(Entry {
                        value: amount.to_string().into_bytes(),
                        expires_at: Some(now + ttl),
                    }),
                };
                std::future::ready(op)
            })
            .await;
        counter_from(key, result, now)
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        let now = Instant::now();
        let expired: Vec<_> = self
            .inner
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key)
            .collect();
        for key in &expired {
            self.inner.invalidate(key.as_str()).await;
        }
        self.inner.run_pending_tasks().await;
        Ok(expired.len() as u64)
    }
}

fn counter_from(
    key: &str,
    result: CompResult<String, Entry>,
    now: Instant,
) -> Result<CounterState, AppError> {
    match result {
        CompResult::Inserted(entry) | CompResult::ReplacedWith(entry) => {
            let entry = entry.into_value();
            Ok(CounterState {
                count: parse_counter(key, &entry.value)?,
                ttl_remaining: entry.remaining(now),
            })
        }
        _ => Err(AppError::CacheUnavailable(format!(
            "value at '{key}' is not an integer"
        ))),
    }
}

// ---------------------------------------------------------------------------
// ScreenshotCache
// ---------------------------------------------------------------------------

/// Cached facts about the last successful scrape of an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeMetadata {
    pub screenshot_count: usize,
    pub scraped_at: DateTime<Utc>,
    pub job_id: Uuid,
}

/// Typed, best-effort view over a [`CacheStore`] for scrape results.
///
/// Backend errors are logged and degrade to a miss (reads) or a no-op
/// (writes).
#[derive(Clone)]
pub struct ScreenshotCache<C: CacheStore> {
    store: C,
    ttls: CacheTtls,
}

impl<C: CacheStore> ScreenshotCache<C> {
    pub fn new(store: C, ttls: CacheTtls) -> Self {
        Self { store, ttls }
    }

    pub fn backend(&self) -> &C {
        &self.store
    }

    pub async fn get_screenshots(&self, store: Store, app_id: &str) -> Option<Vec<String>> {
        let key = CacheKey::Screenshots { store, app_id }.to_string();
        self.get_json(&key).await
    }

    pub async fn get_metadata(&self, store: Store, app_id: &str) -> Option<ScrapeMetadata> {
        let key = CacheKey::Metadata { store, app_id }.to_string();
        self.get_json(&key).await
    }

    pub async fn put_result(
        &self,
        store: Store,
        app_id: &str,
        screenshots: &[String],
        metadata: &ScrapeMetadata,
    ) {
        let key = CacheKey::Screenshots { store, app_id }.to_string();
        self.put_json(&key, &screenshots, self.ttls.screenshots).await;
        let key = CacheKey::Metadata { store, app_id }.to_string();
        self.put_json(&key, metadata, self.ttls.metadata).await;
    }

    /// Take the per-app scrape lock for at most `ttl`.
    ///
    /// Returns false while another holder has it. An unreachable cache
    /// counts as acquired, so an outage never stalls scraping.
    pub async fn try_lock_scrape(&self, store: Store, app_id: &str, ttl: Duration) -> bool {
        let key = CacheKey::ScrapeLock { store, app_id }.to_string();
        match self.store.increment_with_ttl(&key, 1, ttl).await {
            Ok(state) => state.count == 1,
            Err(e) => {
                tracing::warn!(%key, error = %e, "Scrape lock unavailable, proceeding without it");
                true
            }
        }
    }

    pub async fn unlock_scrape(&self, store: Store, app_id: &str) {
        let key = CacheKey::ScrapeLock { store, app_id }.to_string();
        if let Err(e) = self.store.delete(&key).await {
            tracing::warn!(%key, error = %e, "Failed to release scrape lock");
        }
    }

    /// Remove both cached entries for an app. Unlike the other operations,
    /// backend errors are returned to the caller.
    pub async fn invalidate(&self, store: Store, app_id: &str) -> Result<u32, AppError> {
        let mut removed = 0;
        for key in [
            CacheKey::Screenshots { store, app_id },
            CacheKey::Metadata { store, app_id },
        ] {
            if self.store.delete(&key.to_string()).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(%key, error = %e, "Discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(%key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    async fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(%key, error = %e, "Failed to encode cache entry");
                return;
            }
        };
        if let Err(e) = self.store.set(key, bytes, ttl).await {
            tracing::warn!(%key, error = %e, "Cache write failed, skipping");
        }
    }
}
