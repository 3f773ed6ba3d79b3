use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheKey, CacheStore};
use crate::error::AppError;

/// Endpoint name used for single scrape submissions.
pub const ENDPOINT_SCRAPE: &str = "screenshots/scrape";
/// Endpoint name used for batch submissions.
pub const ENDPOINT_BATCH: &str = "screenshots/batch";

/// Subscription tier, ordered from least to most generous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Resolve a tier from request context. Missing or unknown values fall
    /// back to [`Tier::Free`].
    pub fn resolve(raw: Option<&str>) -> Tier {
        match raw.map(str::parse::<Tier>) {
            Some(Ok(tier)) => tier,
            Some(Err(_)) => {
                tracing::debug!(tier = ?raw, "Unknown tier, defaulting to free");
                Tier::Free
            }
            None => Tier::Free,
        }
    }

    pub fn allows_batch(&self) -> bool {
        *self != Tier::Free
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "premium" => Ok(Tier::Premium),
            "enterprise" => Ok(Tier::Enterprise),
            _ => Err(format!("Unknown tier: {}", s)),
        }
    }
}

/// Requests allowed per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierQuota {
    pub limit: u64,
    pub window: Duration,
}

/// Quota table for all tiers.
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    quotas: HashMap<Tier, TierQuota>,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        let hour = Duration::from_secs(3600);
        let quotas = [
            (Tier::Free, 100),
            (Tier::Basic, 500),
            (Tier::Premium, 2000),
            (Tier::Enterprise, 10_000),
        ]
        .into_iter()
        .map(|(tier, limit)| (tier, TierQuota { limit, window: hour }))
        .collect();
        Self { quotas }
    }
}

impl QuotaPolicy {
    pub fn with_quota(mut self, tier: Tier, quota: TierQuota) -> Self {
        self.quotas.insert(tier, quota);
        self
    }

    pub fn quota_for(&self, tier: Tier) -> TierQuota {
        self.quotas.get(&tier).copied().unwrap_or(TierQuota {
            limit: 100,
            window: Duration::from_secs(3600),
        })
    }
}

/// Decision of the admission controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow { remaining: u64 },
    Deny { retry_after: Duration },
}

impl Admission {
    pub fn into_result(self) -> Result<u64, AppError> {
        match self {
            Admission::Allow { remaining } => Ok(remaining),
            Admission::Deny { retry_after } => Err(AppError::QuotaExceeded { retry_after }),
        }
    }
}

/// Snapshot of a client's live rate-limit window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitCounter {
    pub client_id: String,
    pub endpoint: String,
    pub window_start: DateTime<Utc>,
    pub count: u64,
    pub tier: Tier,
}

/// Fixed-window rate limiter over a [`CacheStore`].
///
/// Each admission is one `increment_with_ttl` call on
/// `ratelimit:{client_id}:{endpoint}`; the key's TTL marks the end of the
/// window.
#[derive(Clone)]
pub struct AdmissionController<C: CacheStore> {
    cache: C,
    policy: QuotaPolicy,
}

impl<C: CacheStore> AdmissionController<C> {
    pub fn new(cache: C, policy: QuotaPolicy) -> Self {
        Self { cache, policy }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub async fn check_and_admit(&self, client_id: &str, endpoint: &str, tier: Tier) -> Admission {
        self.check_and_admit_n(client_id, endpoint, tier, 1).await
    }

    /// Charge `cost` requests at once (batch submissions).
    ///
    /// Fails open when the cache is unreachable.
    pub async fn check_and_admit_n(
        &self,
        client_id: &str,
        endpoint: &str,
        tier: Tier,
        cost: u64,
    ) -> Admission {
        let quota = self.policy.quota_for(tier);
        let key = CacheKey::RateLimit {
            client_id,
            endpoint,
        }
        .to_string();

        let state = match self.cache.increment_with_ttl(&key, cost, quota.window).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(%client_id, %endpoint, error = %e, "Rate limiter unavailable, admitting request");
                return Admission::Allow {
                    remaining: quota.limit,
                };
            }
        };

        if state.count > quota.limit {
            let retry_after = state
                .ttl_remaining
                .unwrap_or(quota.window)
                .max(Duration::from_millis(1));
            tracing::info!(%client_id, %endpoint, %tier, count = state.count, limit = quota.limit, "Admission denied");
            Admission::Deny { retry_after }
        } else {
            Admission::Allow {
                remaining: quota.limit - state.count,
            }
        }
    }

    /// The live counter for a client, if one exists in the current window.
    pub async fn counter(
        &self,
        client_id: &str,
        endpoint: &str,
        tier: Tier,
    ) -> Result<Option<RateLimitCounter>, AppError> {
        let key = CacheKey::RateLimit {
            client_id,
            endpoint,
        }
        .to_string();
        let Some(bytes) = self.cache.get(&key).await? else {
            return Ok(None);
        };
        let count = std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let window = self.policy.quota_for(tier).window;
        let remaining = self.cache.ttl(&key).await?.unwrap_or(window);
        let elapsed = window.saturating_sub(remaining);
        let window_start = Utc::now() - TimeDelta::from_std(elapsed).unwrap_or(TimeDelta::zero());

        Ok(Some(RateLimitCounter {
            client_id: client_id.to_string(),
            endpoint: endpoint.to_string(),
            window_start,
            count,
            tier,
        }))
    }
}

/// Per-account decrementing balance, separate from the rate-limit windows.
pub trait QuotaLedger: Send + Sync + Clone {
    /// Deduct `amount` from the client's balance. Returns false, without
    /// deducting, when the balance is insufficient.
    fn try_consume(
        &self,
        client_id: &str,
        amount: u64,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Give back `amount` consumed for work that was never enqueued.
    fn refund(
        &self,
        client_id: &str,
        amount: u64,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Ledger for deployments without billing: every request is covered.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unmetered;

impl QuotaLedger for Unmetered {
    async fn try_consume(&self, _client_id: &str, _amount: u64) -> Result<bool, AppError> {
        Ok(true)
    }

    async fn refund(&self, _client_id: &str, _amount: u64) -> Result<(), AppError> {
        Ok(())
    }
}
