//! Cache warming: pre-scrape frequently requested apps at maintenance
//! priority so interactive requests find them cached.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::Store;

/// Client id warming jobs are recorded under.
pub const WARMING_CLIENT_ID: &str = "cache-warmer";

const POPULAR_PLAYSTORE: [&str; 10] = [
    "com.whatsapp",
    "com.facebook.katana",
    "com.instagram.android",
    "com.snapchat.android",
    "com.google.android.apps.maps",
    "com.netflix.mediaclient",
    "com.spotify.music",
    "com.google.android.youtube",
    "com.android.chrome",
    "com.microsoft.office.word",
];

const POPULAR_APPSTORE: [&str; 10] = [
    "310633997",
    "284882215",
    "389801252",
    "447188347",
    "585027354",
    "363590051",
    "324684580",
    "544007664",
    "358634042",
    "586449534",
];

/// One app to warm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmTarget {
    pub store: Store,
    pub app_id: String,
}

impl WarmTarget {
    pub fn new(store: Store, app_id: impl Into<String>) -> Result<Self, AppError> {
        let app_id = app_id.into();
        store.validate_app_id(&app_id)?;
        Ok(Self { store, app_id })
    }
}

impl fmt::Display for WarmTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.store, self.app_id)
    }
}

/// Parses `store:app_id`, e.g. `playstore:com.whatsapp`.
impl FromStr for WarmTarget {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (store, app_id) = s.trim().split_once(':').ok_or_else(|| {
            AppError::ValidationError(format!("Expected store:app_id, got '{s}'"))
        })?;
        Self::new(store.parse()?, app_id)
    }
}

/// Apps warmed when no list is configured.
pub fn popular_apps() -> Vec<WarmTarget> {
    let play = POPULAR_PLAYSTORE.iter().map(|id| (Store::PlayStore, *id));
    let app = POPULAR_APPSTORE.iter().map(|id| (Store::AppStore, *id));
    play.chain(app)
        .map(|(store, app_id)| WarmTarget {
            store,
            app_id: app_id.to_string(),
        })
        .collect()
}

/// Parse a comma separated `store:app_id` list, dropping duplicates.
pub fn parse_warm_list(raw: &str) -> Result<Vec<WarmTarget>, AppError> {
    let mut targets: Vec<WarmTarget> = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let target: WarmTarget = entry.parse()?;
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
    if targets.is_empty() {
        return Err(AppError::ValidationError("Warm list is empty".to_string()));
    }
    Ok(targets)
}

/// Outcome of one warming run.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct WarmReport {
    /// Jobs enqueued for apps with nothing cached.
    pub queued: Vec<Uuid>,
    /// Apps already cached, as `store:app_id`.
    pub skipped: Vec<String>,
}
