use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::json;

use appshot_core::cache::{CacheTtls, ScrapeMetadata, ScreenshotCache};
use appshot_core::job::Store;

use crate::integration::common::{
    ADMIN_TOKEN, FREE_KEY, METERED_KEY, PREMIUM_KEY, get_with, json_body, post_json,
    setup_test_app, setup_test_app_no_auth,
};

fn scrape_body(app_id: &str, store: &str) -> serde_json::Value {
    json!({"app_id": app_id, "store": store})
}

#[tokio::test]
async fn health_reports_backends_and_queues() {
    let app = setup_test_app().await;

    let response = app
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["cache"], "memory");
    assert_eq!(json["broker"], "memory");
    assert_eq!(json["queue_depth"]["playstore"], 0);
    assert_eq!(json["jobs"]["pending"], 0);
}

#[tokio::test]
async fn unauthenticated_request_returns_401() {
    let app = setup_test_app().await;

    let response = app
        .send(
            Request::post("/v1/screenshots/scrape")
                .header("content-type", "application/json")
                .body(Body::from(scrape_body("com.example.app", "playstore").to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .send(post_json(
            "/v1/screenshots/scrape",
            "wrong-key",
            scrape_body("com.example.app", "playstore"),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn submit_and_poll_job() {
    let app = setup_test_app().await;

    let response = app
        .send(post_json(
            "/v1/screenshots/scrape",
            FREE_KEY,
            scrape_body("com.example.app", "playstore"),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let created = json_body(response).await;
    assert_eq!(created["status"], "queued");
    assert_eq!(created["from_cache"], false);
    let job_id = created["job_id"].as_str().unwrap().to_string();

    let response = app
        .send(get_with(&format!("/v1/screenshots/jobs/{job_id}"), FREE_KEY))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let job = json_body(response).await;
    assert_eq!(job["app_id"], "com.example.app");
    assert_eq!(job["store"], "playstore");
    assert_eq!(job["status"], "queued");
    assert_eq!(job["progress_estimate"], 10.0);
    assert_eq!(job["attempt_count"], 0);
}

#[tokio::test]
async fn jobs_are_private_to_their_client() {
    let app = setup_test_app().await;

    let created = json_body(
        app.send(post_json(
            "/v1/screenshots/scrape",
            FREE_KEY,
            scrape_body("284882215", "appstore"),
        ))
        .await,
    )
    .await;
    let job_id = created["job_id"].as_str().unwrap();

    let response = app
        .send(get_with(&format!("/v1/screenshots/jobs/{job_id}"), PREMIUM_KEY))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .send(get_with(
            &format!("/v1/screenshots/jobs/{}", uuid::Uuid::new_v4()),
            FREE_KEY,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], "not_found");
}

#[tokio::test]
async fn invalid_app_id_is_rejected_without_creating_a_job() {
    let app = setup_test_app().await;

    let response = app
        .send(post_json(
            "/v1/screenshots/scrape",
            FREE_KEY,
            scrape_body("bad id", "playstore"),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "validation_error");

    let response = app
        .send(post_json(
            "/v1/screenshots/scrape",
            FREE_KEY,
            scrape_body("com.example.app", "windows"),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let listed = json_body(app.send(get_with("/v1/jobs", ADMIN_TOKEN)).await).await;
    assert_eq!(listed["total"], 0);
}

#[tokio::test]
async fn free_tier_is_limited_to_100_per_hour() {
    let app = setup_test_app().await;

    for _ in 0..100 {
        let response = app
            .send(post_json(
                "/v1/screenshots/scrape",
                FREE_KEY,
                scrape_body("com.example.app", "playstore"),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let response = app
        .send(post_json(
            "/v1/screenshots/scrape",
            FREE_KEY,
            scrape_body("com.example.app", "playstore"),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 3600);
    assert_eq!(json_body(response).await["error"], "quota_exceeded");
}

#[tokio::test]
async fn exhausted_balance_returns_403() {
    let app = setup_test_app().await;

    let first = app
        .send(post_json(
            "/v1/screenshots/scrape",
            METERED_KEY,
            scrape_body("com.example.app", "playstore"),
        ))
        .await;
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = app
        .send(post_json(
            "/v1/screenshots/scrape",
            METERED_KEY,
            scrape_body("com.example.other", "playstore"),
        ))
        .await;
    assert_eq!(second.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(second).await["error"], "quota_exhausted");
    assert_eq!(app.state.accounts.remaining("metered-client"), Some(0));
}

#[tokio::test]
async fn batch_requires_paid_tier() {
    let app = setup_test_app().await;
    let body = json!({"apps": [{"app_id": "com.example.app", "store": "playstore"}]});

    let response = app
        .send(post_json("/v1/screenshots/batch", FREE_KEY, body))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"], "tier_forbidden");
}

#[tokio::test]
async fn batch_submits_every_app() {
    let app = setup_test_app().await;
    let body = json!({"apps": [
        {"app_id": "com.example.one", "store": "playstore"},
        {"app_id": "id284882215", "store": "appstore"}
    ]});

    let response = app
        .send(post_json("/v1/screenshots/batch", PREMIUM_KEY, body))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = json_body(response).await;
    assert_eq!(json["total"], 2);
    assert_eq!(json["jobs"][0]["status"], "queued");

    let health = json_body(
        app.send(Request::get("/health").body(Body::empty()).unwrap())
            .await,
    )
    .await;
    assert_eq!(health["queue_depth"]["playstore"], 1);
    assert_eq!(health["queue_depth"]["appstore"], 1);
}

#[tokio::test]
async fn oversized_batch_is_rejected() {
    let app = setup_test_app().await;
    let apps: Vec<_> = (0..51)
        .map(|i| json!({"app_id": format!("com.example.app{i}"), "store": "playstore"}))
        .collect();

    let response = app
        .send(post_json(
            "/v1/screenshots/batch",
            PREMIUM_KEY,
            json!({ "apps": apps }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cached_result_is_served_without_queueing() {
    let app = setup_test_app().await;
    let cache = ScreenshotCache::new(app.backends.cache.clone(), CacheTtls::default());
    let urls = vec!["https://cdn.example/1.png".to_string()];
    cache
        .put_result(
            Store::PlayStore,
            "com.example.app",
            &urls,
            &ScrapeMetadata {
                screenshot_count: 1,
                scraped_at: chrono::Utc::now(),
                job_id: uuid::Uuid::new_v4(),
            },
        )
        .await;

    let created = json_body(
        app.send(post_json(
            "/v1/screenshots/scrape",
            FREE_KEY,
            scrape_body("com.example.app", "playstore"),
        ))
        .await,
    )
    .await;
    assert_eq!(created["status"], "completed");
    assert_eq!(created["from_cache"], true);

    let job = json_body(
        app.send(get_with(
            &format!("/v1/screenshots/jobs/{}", created["job_id"].as_str().unwrap()),
            FREE_KEY,
        ))
        .await,
    )
    .await;
    assert_eq!(job["screenshots"], json!(urls));
    assert_eq!(job["progress_estimate"], 100.0);

    let refreshed = json_body(
        app.send(post_json(
            "/v1/screenshots/scrape",
            FREE_KEY,
            json!({"app_id": "com.example.app", "store": "playstore", "force_refresh": true}),
        ))
        .await,
    )
    .await;
    assert_eq!(refreshed["status"], "queued");
}

#[tokio::test]
async fn admin_endpoints_require_token() {
    let app = setup_test_app().await;

    let response = app.send(get_with("/v1/jobs", FREE_KEY)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.send(get_with("/v1/jobs", ADMIN_TOKEN)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn no_admin_token_returns_403() {
    let app = setup_test_app_no_auth().await;

    let response = app.send(get_with("/v1/jobs", "any-token")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"], "forbidden");
}

#[tokio::test]
async fn list_jobs_filters_by_status() {
    let app = setup_test_app().await;
    app.send(post_json(
        "/v1/screenshots/scrape",
        FREE_KEY,
        scrape_body("com.example.app", "playstore"),
    ))
    .await;

    let queued = json_body(app.send(get_with("/v1/jobs?status=queued", ADMIN_TOKEN)).await).await;
    assert_eq!(queued["total"], 1);
    assert_eq!(queued["jobs"][0]["client_id"], "free-client");
    assert_eq!(queued["jobs"][0]["priority"], "interactive");

    let failed = json_body(app.send(get_with("/v1/jobs?status=failed", ADMIN_TOKEN)).await).await;
    assert_eq!(failed["total"], 0);

    let response = app
        .send(get_with("/v1/jobs?status=exploded", ADMIN_TOKEN))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalidate_removes_cached_entries() {
    let app = setup_test_app().await;
    let cache = ScreenshotCache::new(app.backends.cache.clone(), CacheTtls::default());
    cache
        .put_result(
            Store::AppStore,
            "284882215",
            &["https://cdn.example/a.png".to_string()],
            &ScrapeMetadata {
                screenshot_count: 1,
                scraped_at: chrono::Utc::now(),
                job_id: uuid::Uuid::new_v4(),
            },
        )
        .await;

    let response = app
        .send(
            Request::delete("/v1/cache/appstore/284882215")
                .header("authorization", format!("Bearer {ADMIN_TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["removed"], 2);
    assert!(cache.get_screenshots(Store::AppStore, "284882215").await.is_none());
}
