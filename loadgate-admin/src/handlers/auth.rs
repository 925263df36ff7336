use crate::server::AdminState;
use crate::{envelope_err, envelope_ok};
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use loadgate_core::crypto::constant_time_eq;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub auth_key: String,
}

/// Exchange `AUTH_KEY` for the admin session token. Failed attempts
/// feed the lockout counter; while locked, even a correct key is
/// refused so the lockout cannot be probed away.
pub async fn login(
    State(state): State<Arc<AdminState>>,
    Json(body): Json<LoginRequest>,
) -> (StatusCode, Json<Value>) {
    let mut guard = state.login.lock().expect("login guard poisoned");

    if let Some(remaining) = guard.locked_for() {
        return envelope_err(
            StatusCode::TOO_MANY_REQUESTS,
            format!("locked out, retry in {}s", remaining.as_secs().max(1)),
        );
    }

    if constant_time_eq(&body.auth_key, &state.config.auth_key) {
        guard.reset();
        return envelope_ok(json!({ "token": state.config.auth_key }));
    }

    guard.record_failure(
        state.config.max_failed_login_attempts,
        Duration::from_secs(state.config.lockout_duration_seconds),
    );
    envelope_err(StatusCode::UNAUTHORIZED, "invalid auth key")
}
