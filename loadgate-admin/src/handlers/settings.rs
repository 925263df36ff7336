use crate::server::AdminState;
use crate::{envelope_err, envelope_gateway_err, envelope_ok};
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use loadgate_core::group_config::SystemSettings;
use serde_json::Value;
use std::sync::Arc;

pub async fn get_settings(State(state): State<Arc<AdminState>>) -> (StatusCode, Json<Value>) {
    envelope_ok(state.settings.snapshot().as_ref())
}

/// Replace the system-wide defaults. Groups pick the change up on
/// their next request via the settings snapshot.
pub async fn update_settings(
    State(state): State<Arc<AdminState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let settings: SystemSettings = match serde_json::from_value(body) {
        Ok(settings) => settings,
        Err(e) => return envelope_err(StatusCode::BAD_REQUEST, e),
    };
    match state.settings.update(settings).await {
        Ok(()) => envelope_ok(state.settings.snapshot().as_ref()),
        Err(e) => envelope_gateway_err(&e),
    }
}
