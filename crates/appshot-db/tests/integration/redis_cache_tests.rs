use std::time::Duration;

use appshot_core::cache::{CacheStore, CacheTtls, ScrapeMetadata, ScreenshotCache};
use appshot_core::error::AppError;
use appshot_core::job::Store;

use crate::integration::common::setup_test_redis;

#[tokio::test]
async fn set_get_delete() {
    let (cache, _container) = setup_test_redis().await;

    cache
        .set("screenshots:playstore:a", b"[]".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(
        cache.get("screenshots:playstore:a").await.unwrap(),
        Some(b"[]".to_vec())
    );
    assert!(cache.exists("screenshots:playstore:a").await.unwrap());

    let ttl = cache.ttl("screenshots:playstore:a").await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(60));

    assert!(cache.delete("screenshots:playstore:a").await.unwrap());
    assert!(!cache.delete("screenshots:playstore:a").await.unwrap());
    assert_eq!(cache.get("screenshots:playstore:a").await.unwrap(), None);
    assert_eq!(cache.ttl("screenshots:playstore:a").await.unwrap(), None);
}

#[tokio::test]
async fn entry_expires() {
    let (cache, _container) = setup_test_redis().await;

    cache
        .set("short", b"x".to_vec(), Duration::from_millis(100))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cache.get("short").await.unwrap(), None);
}

#[tokio::test]
async fn increment_and_expire() {
    let (cache, _container) = setup_test_redis().await;

    assert_eq!(cache.increment("counter", 1).await.unwrap(), 1);
    assert_eq!(cache.increment("counter", 4).await.unwrap(), 5);
    assert_eq!(cache.ttl("counter").await.unwrap(), None);
    assert!(cache.expire("counter", Duration::from_secs(30)).await.unwrap());
    assert!(cache.ttl("counter").await.unwrap().is_some());
    assert!(!cache.expire("missing", Duration::from_secs(30)).await.unwrap());
}

#[tokio::test]
async fn increment_rejects_non_integer() {
    let (cache, _container) = setup_test_redis().await;

    cache
        .set("text", b"hello".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    let err = cache.increment("text", 1).await.unwrap_err();
    assert!(matches!(err, AppError::CacheUnavailable(_)));
}

#[tokio::test]
async fn increment_with_ttl_keeps_first_window() {
    let (cache, _container) = setup_test_redis().await;
    let key = "ratelimit:client-1:screenshots/scrape";

    let first = cache
        .increment_with_ttl(key, 1, Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(first.count, 1);
    assert_eq!(first.ttl_remaining, Some(Duration::from_secs(3600)));

    let second = cache
        .increment_with_ttl(key, 2, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(second.count, 3);
    let remaining = second.ttl_remaining.unwrap();
    assert!(remaining > Duration::from_secs(3500));
}

#[tokio::test]
async fn concurrent_increments_are_atomic() {
    let (cache, _container) = setup_test_redis().await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            cache
                .increment_with_ttl("hot", 1, Duration::from_secs(60))
                .await
                .unwrap()
                .count
        }));
    }
    let mut counts = Vec::new();
    for handle in handles {
        counts.push(handle.await.unwrap());
    }
    counts.sort();
    assert_eq!(counts, (1..=20).collect::<Vec<u64>>());
}

#[tokio::test]
async fn screenshot_cache_over_redis() {
    let (cache, _container) = setup_test_redis().await;
    let screenshots = ScreenshotCache::new(cache, CacheTtls::default());
    let urls = vec!["https://cdn.example/1.png".to_string()];
    let metadata = ScrapeMetadata {
        screenshot_count: 1,
        scraped_at: chrono::Utc::now(),
        job_id: uuid::Uuid::new_v4(),
    };

    screenshots
        .put_result(Store::AppStore, "284882215", &urls, &metadata)
        .await;
    assert_eq!(
        screenshots.get_screenshots(Store::AppStore, "284882215").await,
        Some(urls)
    );
    assert_eq!(
        screenshots
            .get_metadata(Store::AppStore, "284882215")
            .await
            .unwrap()
            .screenshot_count,
        1
    );

    assert_eq!(
        screenshots.invalidate(Store::AppStore, "284882215").await.unwrap(),
        2
    );
    assert!(screenshots.get_screenshots(Store::AppStore, "284882215").await.is_none());
}
