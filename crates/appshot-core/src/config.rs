use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::retry::RetryPolicy;
use crate::sweeper::SweeperConfig;
use crate::worker::{LEASE_MARGIN, PoolConfig};

const MAX_RETRY_JITTER: Duration = Duration::from_secs(3600);
const MAX_INTERVAL: Duration = Duration::from_secs(30 * 86_400);
const MAX_RETENTION_HOURS: u64 = 10 * 365 * 24;

/// Worker, retry and maintenance settings shared by the server and CLI.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub visibility_timeout: Duration,
    pub sweeper: SweeperConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            visibility_timeout: Duration::from_secs(300),
            sweeper: SweeperConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Read configuration from environment variables.
    ///
    /// - `APPSHOT_WORKERS_PER_STORE` (default 4)
    /// - `APPSHOT_SCRAPE_TIMEOUT_SECS` (default 60)
    /// - `APPSHOT_MAX_ATTEMPTS` (default 3)
    /// - `APPSHOT_RETRY_BASE_SECS` (default 60)
    /// - `APPSHOT_RETRY_MAX_JITTER_SECS` (default 10, at most 3600)
    /// - `APPSHOT_VISIBILITY_TIMEOUT_SECS` (default 300, at least the scrape
    ///   timeout plus [`LEASE_MARGIN`])
    /// - `APPSHOT_SWEEP_INTERVAL_SECS` (default 86400)
    /// - `APPSHOT_JOB_RETENTION_HOURS` (default 168)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`RuntimeConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();

        let workers_per_store: usize = parse_var(&lookup, "APPSHOT_WORKERS_PER_STORE")?
            .unwrap_or(defaults.pool.workers_per_store);
        if workers_per_store == 0 {
            return Err(AppError::ConfigError(
                "APPSHOT_WORKERS_PER_STORE must be at least 1".into(),
            ));
        }

        let max_attempts: u32 =
            parse_var(&lookup, "APPSHOT_MAX_ATTEMPTS")?.unwrap_or(defaults.retry.max_attempts);
        if max_attempts == 0 {
            return Err(AppError::ConfigError(
                "APPSHOT_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }

        let secs = |name: &str, default: Duration| -> Result<Duration, AppError> {
            Ok(parse_var::<u64>(&lookup, name)?
                .map(Duration::from_secs)
                .unwrap_or(default))
        };

        let scrape_timeout = secs("APPSHOT_SCRAPE_TIMEOUT_SECS", defaults.pool.scrape_timeout)?;
        if scrape_timeout.is_zero() || scrape_timeout > MAX_INTERVAL {
            return Err(AppError::ConfigError(format!(
                "APPSHOT_SCRAPE_TIMEOUT_SECS must be between 1 and {}",
                MAX_INTERVAL.as_secs()
            )));
        }

        let job_retention = match parse_var::<u64>(&lookup, "APPSHOT_JOB_RETENTION_HOURS")? {
            None => defaults.sweeper.job_retention,
            Some(h) => h
                .checked_mul(3600)
                .filter(|_| h <= MAX_RETENTION_HOURS)
                .map(Duration::from_secs)
                .ok_or_else(|| {
                    AppError::ConfigError(format!(
                        "APPSHOT_JOB_RETENTION_HOURS must be at most {MAX_RETENTION_HOURS}"
                    ))
                })?,
        };

        let max_jitter = secs("APPSHOT_RETRY_MAX_JITTER_SECS", defaults.retry.max_jitter)?;
        if max_jitter > MAX_RETRY_JITTER {
            return Err(AppError::ConfigError(format!(
                "APPSHOT_RETRY_MAX_JITTER_SECS must be at most {}",
                MAX_RETRY_JITTER.as_secs()
            )));
        }

        let visibility_timeout = secs(
            "APPSHOT_VISIBILITY_TIMEOUT_SECS",
            defaults.visibility_timeout,
        )?;
        let min_visibility = scrape_timeout.saturating_add(LEASE_MARGIN);
        if visibility_timeout < min_visibility || visibility_timeout > MAX_INTERVAL {
            return Err(AppError::ConfigError(format!(
                "APPSHOT_VISIBILITY_TIMEOUT_SECS must be between {} and {} (scrape timeout plus {}s)",
                min_visibility.as_secs(),
                MAX_INTERVAL.as_secs(),
                LEASE_MARGIN.as_secs()
            )));
        }

        let sweep_interval = secs("APPSHOT_SWEEP_INTERVAL_SECS", defaults.sweeper.interval)?;
        if sweep_interval.is_zero() || sweep_interval > MAX_INTERVAL {
            return Err(AppError::ConfigError(format!(
                "APPSHOT_SWEEP_INTERVAL_SECS must be between 1 and {}",
                MAX_INTERVAL.as_secs()
            )));
        }

        Ok(Self {
            pool: PoolConfig {
                workers_per_store,
                scrape_timeout,
                ..defaults.pool
            },
            retry: RetryPolicy {
                max_attempts,
                base_delay: secs("APPSHOT_RETRY_BASE_SECS", defaults.retry.base_delay)?,
                max_jitter,
                ..defaults.retry
            },
            visibility_timeout,
            sweeper: SweeperConfig {
                interval: sweep_interval,
                job_retention,
            },
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, AppError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            AppError::ConfigError(format!(
                "Invalid {name} '{raw}': must be a non-negative integer"
            ))
        }),
    }
}
