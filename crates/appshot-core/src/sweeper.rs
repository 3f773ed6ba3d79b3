use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheStore;
use crate::error::AppError;
use crate::job_store::JobStore;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Terminal jobs older than this are deleted.
    pub job_retention: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 3600),
            job_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cache_entries_purged: u64,
    pub jobs_purged: u64,
}

/// Periodic eviction of expired cache entries and old terminal jobs.
#[derive(Clone)]
pub struct MaintenanceSweeper<C: CacheStore, J: JobStore> {
    cache: C,
    jobs: J,
    config: SweeperConfig,
}

impl<C: CacheStore, J: JobStore> MaintenanceSweeper<C, J> {
    pub fn new(cache: C, jobs: J, config: SweeperConfig) -> Self {
        Self {
            cache,
            jobs,
            config,
        }
    }

    /// One sweep. A cache failure is logged and does not stop the job purge.
    pub async fn sweep_once(&self) -> Result<SweepReport, AppError> {
        let cache_entries_purged = match self.cache.purge_expired().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Cache purge failed");
                0
            }
        };

        let retention = TimeDelta::from_std(self.config.job_retention)
            .map_err(|e| AppError::ConfigError(format!("job retention out of range: {e}")))?;
        let cutoff = Utc::now() - retention;
        let jobs_purged = self.jobs.purge_terminal_before(cutoff).await?;

        tracing::info!(%cache_entries_purged, %jobs_purged, %cutoff, "Maintenance sweep finished");
        Ok(SweepReport {
            cache_entries_purged,
            jobs_purged,
        })
    }

    /// Sweep every `interval` until cancelled. The first sweep runs after one
    /// full interval.
    pub async fn run(&self, cancel_token: CancellationToken) {
        tracing::info!(interval = ?self.config.interval, "Maintenance sweeper started");
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.config.interval) => {}
                () = cancel_token.cancelled() => break,
            }
            if let Err(e) = self.sweep_once().await {
                tracing::error!(error = %e, "Maintenance sweep failed");
            }
        }
        tracing::info!("Maintenance sweeper stopped");
    }
}
