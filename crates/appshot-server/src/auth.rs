use std::sync::Arc;

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

use crate::dto::ErrorResponse;
use crate::state::AppState;

fn bearer_token<B>(request: &Request<B>) -> Option<&str> {
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
}

fn reject(status: StatusCode, error: &str, message: &str) -> Response {
    let body = ErrorResponse {
        error: error.to_string(),
        message: message.to_string(),
        retry_after: None,
    };
    (status, axum::Json(body)).into_response()
}

/// Resolves `Authorization: Bearer <api_key>` to an
/// [`Account`](crate::accounts::Account) and stores it in the request
/// extensions for handlers.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let account = bearer_token(&request).and_then(|token| state.accounts.authenticate(token));

    let Some(account) = account else {
        return reject(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Missing or invalid Authorization header. Expected: Bearer <api_key>",
        );
    };

    tracing::debug!(client_id = %account.client_id, tier = %account.tier, "Authenticated request");
    request.extensions_mut().insert(account);
    next.run(request).await
}

/// Guards operator endpoints with `APPSHOT_ADMIN_TOKEN`.
pub async fn require_admin_token(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return reject(
            StatusCode::FORBIDDEN,
            "forbidden",
            "Admin endpoints are disabled. Set APPSHOT_ADMIN_TOKEN to enable them.",
        );
    };

    let authenticated = bearer_token(&request)
        .is_some_and(|token| bool::from(token.as_bytes().ct_eq(expected.as_bytes())));

    if !authenticated {
        return reject(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Missing or invalid Authorization header. Expected: Bearer <admin_token>",
        );
    }

    next.run(request).await
}
