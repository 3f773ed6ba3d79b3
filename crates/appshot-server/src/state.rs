use appshot_core::service::ScreenshotService;
use appshot_db::{BrokerBackend, CacheBackend, JobBackend};

use crate::accounts::AccountBook;
use crate::dto::BackendNames;

pub type AppService = ScreenshotService<CacheBackend, JobBackend, BrokerBackend, AccountBook>;

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub service: AppService,
    pub accounts: AccountBook,
    /// Token for operator endpoints (None = admin endpoints disabled).
    pub admin_token: Option<String>,
    pub backends: BackendNames,
}
