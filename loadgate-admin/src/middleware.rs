use crate::server::AdminState;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use loadgate_core::crypto::constant_time_eq;
use std::sync::Arc;

/// Session-key middleware for the authenticated admin surface.
/// The bearer token is the session key issued by `/api/auth/login`;
/// comparison is constant time.
pub async fn session_auth(
    State(state): State<Arc<AdminState>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if constant_time_eq(token, &state.config.auth_key) => next.run(request).await,
        _ => crate::envelope_err(StatusCode::UNAUTHORIZED, "invalid session key").into_response(),
    }
}
