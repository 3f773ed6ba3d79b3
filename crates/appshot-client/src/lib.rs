pub mod extract;
pub mod fetcher;

pub use extract::{StoreSelectors, extract_screenshot_urls};
pub use fetcher::{HttpScraper, default_registry};
