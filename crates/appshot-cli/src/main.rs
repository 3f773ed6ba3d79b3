use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use appshot_client::{HttpScraper, default_registry};
use appshot_core::admission::{AdmissionController, QuotaPolicy};
use appshot_core::cache::{CacheTtls, ScreenshotCache};
use appshot_core::config::RuntimeConfig;
use appshot_core::router::JobRouter;
use appshot_core::scraper::ScraperRegistry;
use appshot_core::service::{ScreenshotService, SubmitRequest};
use appshot_core::sweeper::MaintenanceSweeper;
use appshot_core::warming::{WARMING_CLIENT_ID, parse_warm_list, popular_apps};
use appshot_core::worker::{TracingWorkerReporter, WorkerPool};
use appshot_core::{JobStatus, Store};
use appshot_db::{Backends, BrokerBackend, CacheBackend, DatabaseConfig, JobBackend, RedisConfig};

#[derive(Parser)]
#[command(name = "appshot", version, about = "App store screenshot scraping jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scrape workers against the shared queue until interrupted
    Worker {
        /// Only consume jobs for this store (playstore or appstore)
        #[arg(short, long)]
        store: Option<String>,

        /// Concurrent workers per store
        #[arg(short, long, env = "APPSHOT_WORKERS_PER_STORE")]
        workers: Option<usize>,
    },

    /// Purge expired cache entries and old finished jobs
    Sweep {
        /// Keep sweeping on the configured interval instead of exiting
        #[arg(long, default_value_t = false)]
        watch: bool,
    },

    /// Submit a scrape job
    Submit {
        /// Play Store package name or App Store id
        app_id: String,

        /// playstore or appstore
        #[arg(short, long)]
        store: String,

        /// Client the job is billed and rate limited to
        #[arg(short, long, env = "APPSHOT_CLIENT_ID", default_value = "cli")]
        client_id: String,

        /// Rate-limit tier (free, basic, premium, enterprise)
        #[arg(short, long, env = "APPSHOT_TIER")]
        tier: Option<String>,

        /// Ignore cached screenshots
        #[arg(long, default_value_t = false)]
        force_refresh: bool,

        /// Process the job in this process and print the final status
        #[arg(long, default_value_t = false)]
        wait: bool,
    },

    /// Show the status of a job
    Status {
        job_id: Uuid,
    },

    /// Queue maintenance-priority scrapes for popular apps not yet cached
    Warm {
        /// Comma separated store:app_id list (defaults to a built-in list of
        /// popular apps)
        #[arg(long, env = "APPSHOT_WARM_APPS")]
        apps: Option<String>,
    },

    /// Drop cached screenshots for an app
    Invalidate {
        /// playstore or appstore
        store: String,

        app_id: String,
    },
}

type CliService = ScreenshotService<CacheBackend, JobBackend, BrokerBackend>;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("appshot=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut runtime = RuntimeConfig::from_env()?;

    match cli.command {
        Commands::Worker { store, workers } => {
            if let Some(workers) = workers {
                anyhow::ensure!(workers > 0, "--workers must be at least 1");
                runtime.pool.workers_per_store = workers;
            }
            let store = store.map(|s| s.parse::<Store>()).transpose()?;
            let backends = connect(true, &runtime).await?;
            cmd_worker(&backends, &runtime, store).await?;
        }
        Commands::Sweep { watch } => {
            let backends = connect(false, &runtime).await?;
            cmd_sweep(&backends, &runtime, watch).await?;
        }
        Commands::Submit {
            app_id,
            store,
            client_id,
            tier,
            force_refresh,
            wait,
        } => {
            let backends = connect(!wait, &runtime).await?;
            let request = SubmitRequest {
                app_id,
                store,
                client_id,
                tier,
                force_refresh,
            };
            cmd_submit(&backends, &runtime, request, wait).await?;
        }
        Commands::Status { job_id } => {
            let backends = connect(true, &runtime).await?;
            let report = build_service(&backends, &runtime)
                .get_job_status(job_id, None)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Warm { apps } => {
            let targets = match apps {
                Some(raw) => parse_warm_list(&raw)?,
                None => popular_apps(),
            };
            let backends = connect(true, &runtime).await?;
            let report = build_service(&backends, &runtime)
                .warm_cache(&targets, WARMING_CLIENT_ID)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Invalidate { store, app_id } => {
            let backends = connect(false, &runtime).await?;
            let removed = build_service(&backends, &runtime)
                .invalidate(&store, &app_id)
                .await?;
            println!("Removed {removed} cache entries for {store}/{app_id}");
        }
    }

    Ok(())
}

/// Connect storage from `DATABASE_URL` / `REDIS_URL`. Commands that must see
/// jobs created by other processes pass `shared = true`.
async fn connect(shared: bool, runtime: &RuntimeConfig) -> Result<Backends> {
    let database = DatabaseConfig::from_env_optional()?;
    if shared && database.is_none() {
        anyhow::bail!(
            "DATABASE_URL not set. This command needs the shared job store and queue \
             (use `submit --wait` for a one-off local run)."
        );
    }
    let redis = RedisConfig::from_env()?;

    Backends::connect(database.as_ref(), redis.as_ref(), runtime.visibility_timeout)
        .await
        .context("Failed to initialise storage backends")
}

fn build_service(backends: &Backends, runtime: &RuntimeConfig) -> CliService {
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
}

fn build_registry(
    store: Option<Store>,
    runtime: &RuntimeConfig,
) -> Result<ScraperRegistry<HttpScraper>> {
    let timeout = runtime.pool.scrape_timeout;
    let registry = match store {
        Some(store) => {
            ScraperRegistry::new().register(store, HttpScraper::with_timeout(store, timeout)?)
        }
        None => default_registry(timeout)?,
    };
    Ok(registry)
}

fn spawn_pool(
    backends: &Backends,
    runtime: &RuntimeConfig,
    registry: &ScraperRegistry<HttpScraper>,
    cancel: &CancellationToken,
) -> Result<WorkerPool> {
    let pool = WorkerPool::spawn(
        registry,
        backends.jobs.clone(),
        backends.broker.clone(),
        ScreenshotCache::new(backends.cache.clone(), CacheTtls::default()),
        runtime.retry.clone(),
        runtime.pool.clone(),
        TracingWorkerReporter,
        cancel.child_token(),
    )?;
    Ok(pool)
}

async fn cmd_worker(backends: &Backends, runtime: &RuntimeConfig, store: Option<Store>) -> Result<()> {
    let registry = build_registry(store, runtime)?;
    let cancel = CancellationToken::new();
    let pool = spawn_pool(backends, runtime, &registry, &cancel)?;

    tracing::info!(
        workers = pool.worker_count(),
        stores = ?registry.stores(),
        "Workers running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C handler")?;
    tracing::info!("Shutdown signal received, waiting for in-flight jobs");

    pool.shutdown().await;
    Ok(())
}

async fn cmd_sweep(backends: &Backends, runtime: &RuntimeConfig, watch: bool) -> Result<()> {
    let sweeper = MaintenanceSweeper::new(
        backends.cache.clone(),
        backends.jobs.clone(),
        runtime.sweeper.clone(),
    );

    let report = sweeper.sweep_once().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !watch {
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { sweeper.run(token).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C handler")?;
    cancel.cancel();
    handle.await.context("Sweeper task panicked")?;
    Ok(())
}

async fn cmd_submit(
    backends: &Backends,
    runtime: &RuntimeConfig,
    request: SubmitRequest,
    wait: bool,
) -> Result<()> {
    let service = build_service(backends, runtime);
    let submitted = service.submit_job(request).await?;

    if !wait || submitted.status.is_terminal() {
        println!("{}", serde_json::to_string_pretty(&submitted)?);
        return Ok(());
    }

    let registry = build_registry(None, runtime)?;
    let cancel = CancellationToken::new();
    let pool = spawn_pool(backends, runtime, &registry, &cancel)?;

    let report = loop {
        let report = service.get_job_status(submitted.job_id, None).await?;
        if report.status.is_terminal() {
            break report;
        }
        tracing::info!(
            job_id = %submitted.job_id,
            status = %report.status,
            progress = report.progress_estimate,
            "Waiting for job"
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
    };
    pool.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.status == JobStatus::Failed {
        anyhow::bail!(
            "Job {} failed: {}",
            report.job_id,
            report.error_message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
