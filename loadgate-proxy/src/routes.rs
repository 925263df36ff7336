use crate::engine;
use crate::{ProxyState, engine::error_response};
use axum::Router;
use axum::extract::{Path, Request, State};
use axum::response::Response;
use axum::routing::any;
use loadgate_channel::InboundRequest;
use loadgate_core::GatewayError;
use std::sync::Arc;

/// Request bodies above this are rejected before dispatch.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// The proxy surface: `ANY /proxy/{group}/{subpath...}` for all three
/// channel styles. Mounted on the main listener and, when
/// `PROXY_PORT` is set, alone on the stripped listener.
pub fn proxy_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/proxy/{group}/{*subpath}", any(handle_proxy))
        .with_state(state)
}

async fn handle_proxy(
    State(state): State<Arc<ProxyState>>,
    Path((group, subpath)): Path<(String, String)>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let query = parts.uri.query().unwrap_or_default().to_string();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(&GatewayError::Validation("request body too large".into()));
        }
    };
    let inbound = InboundRequest {
        method: parts.method,
        subpath: format!("/{subpath}"),
        query,
        headers: parts.headers,
        body,
    };
    engine::dispatch(&state, &group, inbound).await
}
