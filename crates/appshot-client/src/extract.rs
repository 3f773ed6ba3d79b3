use appshot_core::{AppError, Store};
use scraper::{Html, Selector};
use url::Url;

/// CSS selectors and attributes that locate screenshots on a store page.
#[derive(Debug, Clone)]
pub struct StoreSelectors {
    images: Selector,
    /// Attributes checked in order; the first non-empty one wins.
    attributes: &'static [&'static str],
}

impl StoreSelectors {
    pub fn for_store(store: Store) -> Result<Self, AppError> {
        let (css, attributes): (&str, &'static [&'static str]) = match store {
            Store::PlayStore => (
                "img[data-screenshot-url], img.UCccjd, div[data-screenshot-item-index] img",
                &["data-screenshot-url", "src"],
            ),
            Store::AppStore => (
                "div.we-screenshot-group img, figure.screenshots img, \
                 picture.we-artwork--screenshot-platform-iphone img",
                &["data-src", "src"],
            ),
        };
        let images = Selector::parse(css)
            .map_err(|e| AppError::ConfigError(format!("Invalid {store} selector: {e}")))?;
        Ok(Self { images, attributes })
    }
}

/// Pull absolute screenshot URLs out of a store page, in page order and
/// without duplicates.
pub fn extract_screenshot_urls(html: &str, page_url: &Url, selectors: &StoreSelectors) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut urls: Vec<String> = Vec::new();

    for element in document.select(&selectors.images) {
        let Some(raw) = selectors
            .attributes
            .iter()
            .filter_map(|attr| element.value().attr(attr))
            .map(str::trim)
            .find(|v| !v.is_empty())
        else {
            continue;
        };
        if raw.starts_with("data:") {
            continue;
        }
        // Handles protocol-relative ("//host/x.png") and relative paths.
        let Ok(resolved) = page_url.join(raw) else {
            tracing::debug!(src = %raw, "Skipping unparseable screenshot URL");
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        let resolved = resolved.to_string();
        if !urls.contains(&resolved) {
            urls.push(resolved);
        }
    }

    urls
}
