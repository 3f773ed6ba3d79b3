use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Extension, Router, middleware};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use appshot_core::error::AppError;
use appshot_core::job::JobStatus;
use appshot_core::service::SubmitRequest;

use crate::accounts::Account;
use crate::auth::{require_admin_token, require_api_key};
use crate::dto::{
    BatchRequest, BatchResponse, HealthResponse, InvalidateResponse, JobListResponse,
    JobStatusResponse, JobSummary, ListJobsQuery, ScrapeRequest, SubmitJobResponse,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let client = Router::new()
        .route("/v1/screenshots/scrape", post(scrape))
        .route("/v1/screenshots/batch", post(batch))
        .route("/v1/screenshots/jobs/{id}", get(get_job))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let admin = Router::new()
        .route("/v1/jobs", get(list_jobs))
        .route("/v1/cache/{store}/{app_id}", delete(invalidate_cache))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(client).merge(admin).with_state(state)
}

// ---------------------------------------------------------------------------
// Screenshots
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/screenshots/scrape",
    request_body = ScrapeRequest,
    responses(
        (status = 202, description = "Job accepted (or answered from cache)", body = SubmitJobResponse),
        (status = 400, description = "Invalid app_id or store", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Account balance exhausted", body = crate::dto::ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = crate::dto::ErrorResponse),
        (status = 503, description = "Queue unavailable", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "screenshots"
)]
pub async fn scrape(
    State(state): State<Arc<AppState>>,
    Extension(account): Extension<Account>,
    axum::Json(body): axum::Json<ScrapeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state
        .service
        .submit_job(SubmitRequest {
            app_id: body.app_id,
            store: body.store,
            client_id: account.client_id,
            tier: Some(account.tier.as_str().to_string()),
            force_refresh: body.force_refresh,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        axum::Json(SubmitJobResponse::from(response)),
    ))
}

#[utoipa::path(
    post,
    path = "/v1/screenshots/batch",
    request_body = BatchRequest,
    responses(
        (status = 202, description = "Jobs accepted", body = BatchResponse),
        (status = 400, description = "Empty, oversized or invalid batch", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Tier not allowed or balance exhausted", body = crate::dto::ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "screenshots"
)]
pub async fn batch(
    State(state): State<Arc<AppState>>,
    Extension(account): Extension<Account>,
    axum::Json(body): axum::Json<BatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let items = body.apps.into_iter().map(Into::into).collect();
    let responses = state
        .service
        .batch_submit(
            items,
            &account.client_id,
            Some(account.tier.as_str()),
            body.force_refresh,
        )
        .await?;
    let total = responses.len();

    let response = BatchResponse {
        jobs: responses.into_iter().map(SubmitJobResponse::from).collect(),
        total,
    };

    Ok((StatusCode::ACCEPTED, axum::Json(response)))
}

#[utoipa::path(
    get,
    path = "/v1/screenshots/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job status", body = JobStatusResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "screenshots"
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Extension(account): Extension<Account>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .service
        .get_job_status(id, Some(&account.client_id))
        .await?;

    Ok(axum::Json(JobStatusResponse::from(report)))
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Most recent jobs", body = JobListResponse),
        (status = 400, description = "Unknown status filter", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Admin endpoints disabled"),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status_filter = query
        .status
        .map(|s| s.parse::<JobStatus>().map_err(AppError::ValidationError))
        .transpose()?;

    let limit = query.limit.unwrap_or(20).min(100);
    let jobs = state.service.list_jobs(status_filter, limit).await?;
    let total = jobs.len();

    let response = JobListResponse {
        jobs: jobs.into_iter().map(JobSummary::from).collect(),
        total,
    };

    Ok(axum::Json(response))
}

#[utoipa::path(
    delete,
    path = "/v1/cache/{store}/{app_id}",
    params(
        ("store" = String, Path, description = "playstore or appstore"),
        ("app_id" = String, Path, description = "App identifier"),
    ),
    responses(
        (status = 200, description = "Cache entries removed", body = InvalidateResponse),
        (status = 400, description = "Invalid app_id or store", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Admin endpoints disabled"),
        (status = 503, description = "Cache unavailable", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn invalidate_cache(
    State(state): State<Arc<AppState>>,
    Path((store, app_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state.service.invalidate(&store, &app_id).await?;

    Ok(axum::Json(InvalidateResponse {
        store,
        app_id,
        removed,
    }))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Job store or broker unreachable", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = match state.service.queue_stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            None
        }
    };

    let status = if stats.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        axum::Json(HealthResponse::from_stats(state.backends, stats)),
    )
}
