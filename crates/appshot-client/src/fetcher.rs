use std::time::Duration;

use appshot_core::scraper::{ScrapeError, Scraper, ScraperRegistry};
use appshot_core::{AppError, Store};
use reqwest::{Client, StatusCode};
use url::Url;

use crate::extract::{StoreSelectors, extract_screenshot_urls};

/// Store-page scraper using reqwest.
///
/// Downloads the public listing page of an app and extracts its screenshot
/// URLs. One instance serves one store.
#[derive(Clone)]
pub struct HttpScraper {
    client: Client,
    store: Store,
    base_url: Url,
    selectors: StoreSelectors,
}

impl HttpScraper {
    pub fn new(store: Store) -> Result<Self, AppError> {
        Self::with_timeout(store, Duration::from_secs(30))
    }

    pub fn with_timeout(store: Store, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent("Mozilla/5.0 (compatible; Appshot/0.1)")
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;
        let base_url = Url::parse(default_base_url(store))
            .map_err(|e| AppError::ConfigError(format!("Invalid base URL: {e}")))?;

        Ok(Self {
            client,
            store,
            base_url,
            selectors: StoreSelectors::for_store(store)?,
        })
    }

    /// Point the scraper at a different host (mirrors, local fixtures).
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, AppError> {
        self.base_url = Url::parse(base_url)
            .map_err(|e| AppError::ConfigError(format!("Invalid base URL '{base_url}': {e}")))?;
        Ok(self)
    }

    pub fn store(&self) -> Store {
        self.store
    }

    /// Listing page for `app_id`.
    pub fn page_url(&self, app_id: &str) -> Url {
        let mut url = self.base_url.clone();
        match self.store {
            Store::PlayStore => {
                url.set_path("/store/apps/details");
                url.query_pairs_mut()
                    .clear()
                    .append_pair("id", app_id)
                    .append_pair("hl", "en");
            }
            Store::AppStore => {
                let id = app_id.strip_prefix("id").unwrap_or(app_id);
                url.set_path(&format!("/us/app/id{id}"));
                url.set_query(None);
            }
        }
        url
    }
}

/// One [`HttpScraper`] per supported store.
pub fn default_registry(timeout: Duration) -> Result<ScraperRegistry<HttpScraper>, AppError> {
    Store::ALL.into_iter().try_fold(ScraperRegistry::new(), |registry, store| {
        Ok(registry.register(store, HttpScraper::with_timeout(store, timeout)?))
    })
}

fn default_base_url(store: Store) -> &'static str {
    match store {
        Store::PlayStore => "https://play.google.com",
        Store::AppStore => "https://apps.apple.com",
    }
}

/// Map a non-success status to a scrape error; `None` for success.
fn classify_status(status: StatusCode, url: &Url) -> Option<ScrapeError> {
    if status.is_success() {
        return None;
    }
    let message = format!("HTTP {} for {}", status.as_u16(), url);
    let retryable = status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error();
    Some(ScrapeError { message, retryable })
}

impl Scraper for HttpScraper {
    async fn scrape(&self, app_id: &str) -> Result<Vec<String>, ScrapeError> {
        let url = self.page_url(app_id);

        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                ScrapeError::retryable(format!("Request to {url} timed out"))
            } else if e.is_connect() {
                ScrapeError::retryable(format!("Connection failed: {e}"))
            } else if e.is_builder() {
                ScrapeError::permanent(e.to_string())
            } else {
                ScrapeError::retryable(e.to_string())
            }
        })?;

        if let Some(err) = classify_status(response.status(), &url) {
            return Err(err);
        }

        let html = response
            .text()
            .await
            .map_err(|e| ScrapeError::retryable(format!("Failed to read response body: {e}")))?;

        let urls = extract_screenshot_urls(&html, &url, &self.selectors);
        if urls.is_empty() {
            tracing::warn!(store = %self.store, %app_id, "No screenshots found on store page");
        } else {
            tracing::debug!(store = %self.store, %app_id, count = urls.len(), "Extracted screenshots");
        }
        Ok(urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playstore_page_url() {
        let scraper = HttpScraper::new(Store::PlayStore).unwrap();
        let url = scraper.page_url("com.example.app");
        assert_eq!(
            url.as_str(),
            "https://play.google.com/store/apps/details?id=com.example.app&hl=en"
        );
    }

    #[test]
    fn test_appstore_page_url_strips_id_prefix() {
        let scraper = HttpScraper::new(Store::AppStore).unwrap();
        assert_eq!(
            scraper.page_url("id284882215").as_str(),
            "https://apps.apple.com/us/app/id284882215"
        );
        assert_eq!(
            scraper.page_url("284882215").as_str(),
            "https://apps.apple.com/us/app/id284882215"
        );
    }

    #[test]
    fn test_custom_base_url() {
        let scraper = HttpScraper::new(Store::AppStore)
            .unwrap()
            .with_base_url("http://localhost:8080")
            .unwrap();
        assert_eq!(
            scraper.page_url("284882215").as_str(),
            "http://localhost:8080/us/app/id284882215"
        );
        assert!(HttpScraper::new(Store::AppStore)
            .unwrap()
            .with_base_url("not a url")
            .is_err());
    }

    #[test]
    fn test_status_classification() {
        let url = Url::parse("https://apps.apple.com/us/app/id1").unwrap();
        assert!(classify_status(StatusCode::OK, &url).is_none());
        assert!(!classify_status(StatusCode::NOT_FOUND, &url).unwrap().retryable);
        assert!(!classify_status(StatusCode::FORBIDDEN, &url).unwrap().retryable);
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, &url).unwrap().retryable);
        assert!(classify_status(StatusCode::BAD_GATEWAY, &url).unwrap().retryable);
    }

    #[test]
    fn test_default_registry_covers_every_store() {
        let registry = default_registry(Duration::from_secs(5)).unwrap();
        for store in Store::ALL {
            assert_eq!(registry.scraper_for(store).unwrap().store(), store);
        }
    }

    #[tokio::test]
    async fn test_unreachable_host_is_retryable() {
        let scraper = HttpScraper::with_timeout(Store::PlayStore, Duration::from_secs(2))
            .unwrap()
            .with_base_url("http://127.0.0.1:9")
            .unwrap();
        let err = scraper.scrape("com.example.app").await.unwrap_err();
        assert!(err.retryable);
    }
}
