use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use appshot_client::default_registry;
use appshot_core::cache::{CacheTtls, ScreenshotCache};
use appshot_core::config::RuntimeConfig;
use appshot_core::sweeper::MaintenanceSweeper;
use appshot_core::worker::{TracingWorkerReporter, WorkerPool};
use appshot_db::{Backends, DatabaseConfig, RedisConfig};
use appshot_server::accounts::AccountBook;
use appshot_server::{app, routes};

/// Largest accepted request body; a full batch is a few kilobytes.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("appshot=info".parse()?))
        .with_target(false)
        .init();

    let runtime = RuntimeConfig::from_env()?;
    let database = DatabaseConfig::from_env_optional()?;
    let redis = RedisConfig::from_env()?;
    let accounts = AccountBook::from_env()?;
    let admin_token = std::env::var("APPSHOT_ADMIN_TOKEN")
        .ok()
        .filter(|t| !t.is_empty());
    let port = std::env::var("APPSHOT_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");

    let backends = Backends::connect(database.as_ref(), redis.as_ref(), runtime.visibility_timeout)
        .await
        .context("Failed to initialise storage backends")?;

    let embedded_workers = match std::env::var("APPSHOT_EMBEDDED_WORKERS") {
        Ok(raw) => raw.parse::<bool>().with_context(|| {
            format!("Invalid APPSHOT_EMBEDDED_WORKERS '{raw}': expected true or false")
        })?,
        Err(_) => true,
    };
    if !embedded_workers && backends.is_process_local() {
        anyhow::bail!(
            "APPSHOT_EMBEDDED_WORKERS=false needs DATABASE_URL: the in-memory queue is not shared"
        );
    }

    let cancel = CancellationToken::new();
    let screenshots = ScreenshotCache::new(backends.cache.clone(), CacheTtls::default());

    let pool = if embedded_workers {
        let registry = default_registry(runtime.pool.scrape_timeout)?;
        let pool = WorkerPool::spawn(
            &registry,
            backends.jobs.clone(),
            backends.broker.clone(),
            screenshots,
            runtime.retry.clone(),
            runtime.pool.clone(),
            TracingWorkerReporter,
            cancel.child_token(),
        )?;
        tracing::info!(workers = pool.worker_count(), "Embedded workers started");
        Some(pool)
    } else {
        None
    };

    let sweeper = MaintenanceSweeper::new(
        backends.cache.clone(),
        backends.jobs.clone(),
        runtime.sweeper.clone(),
    );
    let sweeper_token = cancel.child_token();
    let sweeper_handle = tokio::spawn(async move { sweeper.run(sweeper_token).await });

    let state = app::build_state(&backends, &runtime, accounts, admin_token);
    let app = routes::router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    let _ = sweeper_handle.await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
