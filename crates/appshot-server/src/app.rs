//! Composition root shared by `main` and the tests.

use std::sync::Arc;

use appshot_core::admission::{AdmissionController, QuotaPolicy};
use appshot_core::cache::{CacheTtls, ScreenshotCache};
use appshot_core::config::RuntimeConfig;
use appshot_core::router::JobRouter;
use appshot_core::service::ScreenshotService;
use appshot_db::Backends;

use crate::accounts::AccountBook;
use crate::dto::BackendNames;
use crate::state::{AppService, AppState};

pub fn build_service(
    backends: &Backends,
    runtime: &RuntimeConfig,
    accounts: AccountBook,
) -> AppService {
    let screenshots = ScreenshotCache::new(backends.cache.clone(), CacheTtls::default());
    let admission = AdmissionController::new(backends.cache.clone(), QuotaPolicy::default());
    let router = JobRouter::new(
        screenshots.clone(),
        backends.jobs.clone(),
        backends.broker.clone(),
    )
    .with_max_attempts(runtime.retry.max_attempts);

    ScreenshotService::new(
        admission,
        screenshots,
        router,
        backends.jobs.clone(),
        backends.broker.clone(),
    )
    .with_ledger(accounts)
}

pub fn build_state(
    backends: &Backends,
    runtime: &RuntimeConfig,
    accounts: AccountBook,
    admin_token: Option<String>,
) -> Arc<AppState> {
    Arc::new(AppState {
        service: build_service(backends, runtime, accounts.clone()),
        accounts,
        admin_token,
        backends: BackendNames {
            cache: backends.cache.name(),
            jobs: backends.jobs.name(),
            broker: backends.broker.name(),
        },
    })
}
