use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Appshot API",
        version = "0.1.0",
        description = "Asynchronous app store screenshot scraping."
    ),
    paths(
        crate::routes::scrape,
        crate::routes::batch,
        crate::routes::get_job,
        crate::routes::list_jobs,
        crate::routes::invalidate_cache,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::ScrapeRequest,
        crate::dto::SubmitJobResponse,
        crate::dto::BatchEntry,
        crate::dto::BatchRequest,
        crate::dto::BatchResponse,
        crate::dto::JobStatusResponse,
        crate::dto::JobSummary,
        crate::dto::JobListResponse,
        crate::dto::InvalidateResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "screenshots", description = "Screenshot scrape jobs"),
        (name = "admin", description = "Operator endpoints"),
        (name = "system", description = "Health and queue status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI spec.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "Client API key from APPSHOT_ACCOUNTS, or APPSHOT_ADMIN_TOKEN for admin routes.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
