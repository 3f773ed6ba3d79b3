use appshot_core::AppError;

/// Configuration for the database connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Read configuration from environment variables.
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS` (optional, defaults to 10)
    pub fn from_env() -> Result<Self, AppError> {
        let url = std::env::var("DATABASE_URL").map_err(|_| {
            AppError::ConfigError("DATABASE_URL not set. Required for the job store.".into())
        })?;
        let max_connections =
            parse_max_connections(std::env::var("DATABASE_MAX_CONNECTIONS").ok().as_deref())?;

        Ok(Self {
            url,
            max_connections,
        })
    }

    /// Like [`DatabaseConfig::from_env`], but `Ok(None)` when `DATABASE_URL`
    /// is unset so callers can fall back to in-memory stores.
    pub fn from_env_optional() -> Result<Option<Self>, AppError> {
        if std::env::var("DATABASE_URL").is_err() {
            return Ok(None);
        }
        Self::from_env().map(Some)
    }
}

fn parse_max_connections(raw: Option<&str>) -> Result<u32, AppError> {
    let Some(raw) = raw else {
        return Ok(10);
    };
    let parsed: u32 = raw.parse().map_err(|_| {
        AppError::ConfigError(format!(
            "Invalid DATABASE_MAX_CONNECTIONS '{raw}': must be a positive integer"
        ))
    })?;
    if parsed == 0 {
        return Err(AppError::ConfigError(
            "DATABASE_MAX_CONNECTIONS must be at least 1".into(),
        ));
    }
    Ok(parsed)
}

/// Redis connection settings for the shared cache.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

impl RedisConfig {
    /// Reads `REDIS_URL`. `Ok(None)` when unset; the in-process cache is used
    /// instead.
    pub fn from_env() -> Result<Option<Self>, AppError> {
        match std::env::var("REDIS_URL") {
            Err(_) => Ok(None),
            Ok(url) if url.trim().is_empty() => Err(AppError::ConfigError(
                "REDIS_URL is set but empty".into(),
            )),
            Ok(url) => Ok(Some(Self { url })),
        }
    }
}
