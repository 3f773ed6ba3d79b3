use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use tower::ServiceExt;

use appshot_core::config::RuntimeConfig;
use appshot_db::Backends;
use appshot_server::accounts::AccountBook;
use appshot_server::app::build_state;
use appshot_server::routes;
use appshot_server::state::AppState;

pub const FREE_KEY: &str = "free-key";
pub const PREMIUM_KEY: &str = "premium-key";
pub const METERED_KEY: &str = "metered-key";
pub const ADMIN_TOKEN: &str = "admin-secret";

const ACCOUNTS: &str = r#"[
    {"api_key": "free-key", "client_id": "free-client"},
    {"api_key": "premium-key", "client_id": "premium-client", "tier": "premium"},
    {"api_key": "metered-key", "client_id": "metered-client", "tier": "basic", "quota": 1}
]"#;

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub backends: Backends,
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

fn build(admin_token: Option<&str>) -> TestApp {
    let backends = Backends::in_memory(Duration::from_secs(300));
    let accounts = AccountBook::from_json(ACCOUNTS).unwrap();
    let state = build_state(
        &backends,
        &RuntimeConfig::default(),
        accounts,
        admin_token.map(str::to_string),
    );

    TestApp {
        router: routes::router(state.clone()),
        state,
        backends,
    }
}

/// App on in-memory backends with admin endpoints enabled. No workers run,
/// so submitted jobs stay queued.
pub async fn setup_test_app() -> TestApp {
    build(Some(ADMIN_TOKEN))
}

/// Same, with `APPSHOT_ADMIN_TOKEN` unset.
pub async fn setup_test_app_no_auth() -> TestApp {
    build(None)
}

pub fn post_json(uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get_with(uri: &str, token: &str) -> Request<Body> {
    Request::get(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}
