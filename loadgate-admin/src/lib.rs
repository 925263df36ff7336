pub mod handlers;
pub mod middleware;
pub mod persist;
pub mod server;

use axum::Json;
use axum::http::StatusCode;
use serde_json::{Value, json};

/// Uniform admin envelope: `{code, message, data}`.
pub fn envelope_ok(data: impl serde::Serialize) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({ "code": 0, "message": "ok", "data": data })),
    )
}

pub fn envelope_err(status: StatusCode, message: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({ "code": status.as_u16(), "message": message.to_string(), "data": null })),
    )
}

/// Map a gateway error onto the envelope, hiding internal detail.
pub fn envelope_gateway_err(err: &loadgate_core::GatewayError) -> (StatusCode, Json<Value>) {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "Admin internal error");
        return envelope_err(status, "internal error");
    }
    envelope_err(status, err)
}
