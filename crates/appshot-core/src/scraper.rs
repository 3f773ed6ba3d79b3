use std::collections::HashMap;
use std::future::Future;

use thiserror::Error;

use crate::error::AppError;
use crate::job::Store;
use crate::retry::ScrapeOutcome;

/// Failure reported by a store scraper.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ScrapeError {
    pub message: String,
    pub retryable: bool,
}

impl ScrapeError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<ScrapeError> for AppError {
    fn from(e: ScrapeError) -> Self {
        if e.retryable {
            AppError::TransientScrapeError(e.message)
        } else {
            AppError::PermanentScrapeError(e.message)
        }
    }
}

impl From<Result<Vec<String>, ScrapeError>> for ScrapeOutcome {
    fn from(result: Result<Vec<String>, ScrapeError>) -> Self {
        match result {
            Ok(urls) => ScrapeOutcome::Success(urls),
            Err(e) if e.retryable => ScrapeOutcome::RetryableFailure(e.message),
            Err(e) => ScrapeOutcome::PermanentFailure(e.message),
        }
    }
}

/// Fetches the screenshot URLs for one app from one store.
pub trait Scraper: Send + Sync + Clone {
    fn scrape(
        &self,
        app_id: &str,
    ) -> impl Future<Output = Result<Vec<String>, ScrapeError>> + Send;
}

/// Lookup table from store to its scraper.
#[derive(Clone)]
pub struct ScraperRegistry<S: Scraper> {
    scrapers: HashMap<Store, S>,
}

impl<S: Scraper> Default for ScraperRegistry<S> {
    fn default() -> Self {
        Self {
            scrapers: HashMap::new(),
        }
    }
}

impl<S: Scraper> ScraperRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, store: Store, scraper: S) -> Self {
        self.scrapers.insert(store, scraper);
        self
    }

    pub fn scraper_for(&self, store: Store) -> Result<&S, AppError> {
        self.scrapers
            .get(&store)
            .ok_or_else(|| AppError::ConfigError(format!("No scraper registered for {store}")))
    }

    /// Registered stores in declaration order.
    pub fn stores(&self) -> Vec<Store> {
        Store::ALL
            .into_iter()
            .filter(|s| self.scrapers.contains_key(s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockScraper;

    #[test]
    fn test_registry_lookup() {
        let registry = ScraperRegistry::new().register(Store::AppStore, MockScraper::new(vec![]));
        assert!(registry.scraper_for(Store::AppStore).is_ok());
        assert!(matches!(
            registry.scraper_for(Store::PlayStore),
            Err(AppError::ConfigError(_))
        ));
        assert_eq!(registry.stores(), vec![Store::AppStore]);
    }

    #[test]
    fn test_outcome_conversion() {
        let outcome: ScrapeOutcome = Err(ScrapeError::retryable("503")).into();
        assert_eq!(outcome, ScrapeOutcome::RetryableFailure("503".into()));
        let outcome: ScrapeOutcome = Err(ScrapeError::permanent("404")).into();
        assert_eq!(outcome, ScrapeOutcome::PermanentFailure("404".into()));
    }

    #[test]
    fn test_scrape_error_into_app_error() {
        let err: AppError = ScrapeError::retryable("reset").into();
        assert!(err.is_retryable());
        let err: AppError = ScrapeError::permanent("gone").into();
        assert!(!err.is_retryable());
    }
}
