use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::server::AppState;
use crate::translate::openai_types::ErrorResponse;

/// Require `Authorization: Bearer <key>` when an API key is configured.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(req).await;
    };

    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let rejection = if header_value.is_empty() {
        Some(("missing_authorization", "Authorization header is required"))
    } else {
        match header_value.strip_prefix("Bearer ") {
            None => Some((
                "invalid_authorization_format",
                "Authorization header must start with 'Bearer '",
            )),
            Some(token) if token != expected => Some(("invalid_api_key", "Invalid API key")),
            Some(_) => None,
        }
    };

    match rejection {
        Some((code, message)) => {
            state.logger.warn("auth", format!("Rejected request: {code}"));
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::invalid_request(code, message)),
            )
                .into_response()
        }
        None => next.run(req).await,
    }
}
