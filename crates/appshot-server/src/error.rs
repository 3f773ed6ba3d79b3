use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use appshot_core::error::AppError;

use crate::dto::ErrorResponse;

/// Wrapper so we can implement `IntoResponse` for `AppError`.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

fn classify(err: &AppError) -> (StatusCode, &'static str) {
    match err {
        AppError::ValidationError(_) => (StatusCode::BAD_REQUEST, "validation_error"),
        AppError::SerializationError(_) => (StatusCode::BAD_REQUEST, "serialization_error"),
        AppError::QuotaExceeded { .. } => (StatusCode::TOO_MANY_REQUESTS, "quota_exceeded"),
        AppError::QuotaExhausted(_) => (StatusCode::FORBIDDEN, "quota_exhausted"),
        AppError::TierForbidden { .. } => (StatusCode::FORBIDDEN, "tier_forbidden"),
        AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        AppError::StateConflict { .. } | AppError::AttemptsExhausted { .. } => {
            (StatusCode::CONFLICT, "conflict")
        }
        AppError::BrokerUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "broker_unavailable"),
        AppError::CacheUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "cache_unavailable"),
        AppError::DatabaseError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
        AppError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
        AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = classify(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        let retry_after = self.0.retry_after_secs();
        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.0.to_string(),
            retry_after,
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
