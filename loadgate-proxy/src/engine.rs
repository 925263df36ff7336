use crate::limiter::RateDecision;
use crate::{ProxyState, auth, relay};
use axum::body::Body;
use axum::response::Response;
use loadgate_channel::{ChannelAdapter, InboundRequest};
use loadgate_core::GatewayError;
use loadgate_core::group::{Group, UpstreamTarget, pick_weighted};
use loadgate_core::group_config::EffectiveConfig;
use loadgate_core::key::FailureKind;
use loadgate_core::log::RequestLog;
use loadgate_pool::PoolEntry;
use loadgate_store::cache::CachedGroup;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upstream attempt classification, per response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    /// Connect errors, timeouts, 408/429/5xx — try the next key.
    Retryable,
    /// 401/403 — the key is bad; counts toward the blacklist.
    Attributable,
    /// Any other 4xx/3xx — relay the provider's diagnostic verbatim.
    Permanent,
}

fn classify(status: u16) -> Outcome {
    match status {
        200..=299 => Outcome::Success,
        401 | 403 => Outcome::Attributable,
        408 | 429 | 500..=599 => Outcome::Retryable,
        _ => Outcome::Permanent,
    }
}

/// Entry point for one proxied request. Never panics and never
/// returns a transport-level error: every failure becomes a
/// well-formed JSON response.
pub async fn dispatch(state: &ProxyState, group_name: &str, inbound: InboundRequest) -> Response {
    match dispatch_inner(state, group_name, inbound).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

async fn dispatch_inner(
    state: &ProxyState,
    group_name: &str,
    inbound: InboundRequest,
) -> Result<Response, GatewayError> {
    let _permit = state
        .concurrency
        .acquire()
        .await
        .map_err(|_| GatewayError::Internal("server shutting down".into()))?;

    let routed = state.cache.get(group_name).await?;
    let route_adapter = adapter_for(state, &routed.group)?;

    auth::authorize(
        &routed.group,
        route_adapter.extract_proxy_key(&inbound).as_deref(),
    )?;

    // quota check on the addressed group; denied requests are not counted
    if let RateDecision::Deny { reason, reset_at, limit, used } =
        state.limiter.check(&routed.group).await?
    {
        state
            .metrics
            .rate_limited_total
            .with_label_values(&[routed.group.name.as_str(), reason])
            .inc();
        return Ok(deny_response(reason, reset_at, limit, used));
    }

    let serving: Arc<CachedGroup> = if routed.group.is_aggregate() {
        state.cache.pick_child(routed.group.id).await?
    } else {
        Arc::clone(&routed)
    };
    let adapter = adapter_for(state, &serving.group)?;
    let is_stream = adapter.is_stream(&inbound);
    let effective = serving.group.config.effective(&state.settings.snapshot());

    run_attempts(state, adapter.as_ref(), &serving.group, &inbound, is_stream, &effective).await
}

fn adapter_for<'a>(
    state: &'a ProxyState,
    group: &Group,
) -> Result<&'a Arc<dyn ChannelAdapter>, GatewayError> {
    state.registry.get(&group.channel_type).ok_or_else(|| {
        GatewayError::Internal(format!("unregistered channel type: {}", group.channel_type))
    })
}

/// The retry loop: up to `max_retries + 1` attempts, each with a
/// freshly selected upstream and key. A streaming response never
/// retries once the status line has been relayed.
async fn run_attempts(
    state: &ProxyState,
    adapter: &dyn ChannelAdapter,
    group: &Group,
    inbound: &InboundRequest,
    is_stream: bool,
    effective: &EffectiveConfig,
) -> Result<Response, GatewayError> {
    let started = Instant::now();
    let attempts = effective.max_retries + 1;
    let mut last_error = String::from("no attempt made");

    for attempt in 0..attempts {
        if attempt > 0 {
            state.metrics.retries_total.inc();
        }
        let upstream = select_upstream(group)?;
        let entry = state.pool.acquire(group.id).await.map_err(|e| match e {
            GatewayError::NoActiveKey(_) => GatewayError::NoActiveKey(group.name.clone()),
            other => other,
        })?;
        let outbound = adapter.prepare_request(inbound, &upstream.url, &entry.key, group)?;

        let request = state
            .client
            .request(outbound.method.clone(), &outbound.url)
            .headers(outbound.headers.clone())
            .body(outbound.body.clone());

        // streams get a header deadline only; buffered requests get
        // the full upstream budget
        let deadline = if is_stream {
            Duration::from_secs(effective.response_header_timeout_seconds)
        } else {
            Duration::from_secs(effective.upstream_timeout_seconds)
        };

        let response = match tokio::time::timeout(deadline, request.send()).await {
            Err(_) => {
                last_error = format!("upstream timeout after {}s", deadline.as_secs());
                report_failure(state, &entry, FailureKind::Transient, &last_error, effective).await;
                continue;
            }
            Ok(Err(e)) => {
                last_error = format!("upstream connect error: {e}");
                report_failure(state, &entry, FailureKind::Transient, &last_error, effective).await;
                continue;
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status().as_u16();
        match classify(status) {
            Outcome::Success => {
                if is_stream {
                    state.pool.report_success(entry.id).await?;
                    state.metrics.observe_request(&group.name, status);
                    let log = build_log(group, &upstream.url, &entry, &outbound.model, status, started, true, attempt);
                    return Ok(relay::streaming_response(response, log, state.logs.clone()));
                }
                // a mid-body failure on a buffered response is still
                // retryable: the client has seen nothing yet
                let status_line = response.status();
                let headers = response.headers().clone();
                match response.bytes().await {
                    Ok(body) => {
                        state.pool.report_success(entry.id).await?;
                        state.metrics.observe_request(&group.name, status);
                        let mut log = build_log(
                            group, &upstream.url, &entry, &outbound.model, status, started, false, attempt,
                        );
                        log.duration_ms = started.elapsed().as_millis() as i64;
                        state.logs.send(log);
                        return Ok(relay::buffered_response(status_line, &headers, body));
                    }
                    Err(e) => {
                        last_error = format!("body read failed: {e}");
                        report_failure(state, &entry, FailureKind::Transient, &last_error, effective).await;
                        continue;
                    }
                }
            }
            Outcome::Attributable => {
                last_error = format!("status {status}");
                report_failure(state, &entry, FailureKind::Auth, &last_error, effective).await;
                debug!(group = %group.name, key_id = entry.id, status, "Key rejected by upstream");
                continue;
            }
            Outcome::Retryable => {
                last_error = format!("status {status}");
                report_failure(state, &entry, FailureKind::Transient, &last_error, effective).await;
                continue;
            }
            Outcome::Permanent => {
                // the provider's own diagnostic, relayed verbatim
                report_failure(state, &entry, FailureKind::Transient, &format!("status {status}"), effective)
                    .await;
                let status_line = response.status();
                let headers = response.headers().clone();
                match response.bytes().await {
                    Ok(body) => {
                        state.metrics.observe_request(&group.name, status);
                        let mut log = build_log(
                            group, &upstream.url, &entry, &outbound.model, status, started, is_stream, attempt,
                        );
                        log.error_message = Some(format!("upstream status {status}"));
                        state.logs.send(log);
                        return Ok(relay::buffered_response(status_line, &headers, body));
                    }
                    Err(e) => {
                        last_error = format!("body read failed: {e}");
                        continue;
                    }
                }
            }
        }
    }

    // retry budget exhausted
    warn!(group = %group.name, attempts, last_error = %last_error, "Upstream attempts exhausted");
    state.metrics.observe_request(&group.name, 502);
    let mut log = build_log(group, "", &placeholder_entry(group), "", 502, started, is_stream, attempts - 1);
    log.error_message = Some(last_error.clone());
    state.logs.send(log);
    Ok(exhausted_response(attempts.saturating_sub(1), &last_error))
}

fn select_upstream(group: &Group) -> Result<&UpstreamTarget, GatewayError> {
    pick_weighted(&group.upstreams, |u| u.weight)
        .ok_or_else(|| GatewayError::Internal(format!("group {} has no eligible upstream", group.name)))
}

async fn report_failure(
    state: &ProxyState,
    entry: &PoolEntry,
    kind: FailureKind,
    error: &str,
    effective: &EffectiveConfig,
) {
    if let Err(e) = state
        .pool
        .report_failure(entry.id, kind, error, effective.blacklist_threshold)
        .await
    {
        warn!(key_id = entry.id, error = %e, "Failure accounting error");
    }
}

#[allow(clippy::too_many_arguments)]
fn build_log(
    group: &Group,
    upstream_url: &str,
    entry: &PoolEntry,
    model: &str,
    status: u16,
    started: Instant,
    is_stream: bool,
    retries: u32,
) -> RequestLog {
    RequestLog {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: chrono::Utc::now(),
        group_id: group.id,
        group_name: group.name.clone(),
        upstream_url: upstream_url.to_string(),
        key_hash: entry.key_hash.clone(),
        key_value: entry.encrypted.clone(),
        model: model.to_string(),
        status_code: status,
        duration_ms: started.elapsed().as_millis() as i64,
        is_stream,
        retries,
        error_message: None,
    }
}

/// Stand-in for the exhaustion log, where no key is attributable.
fn placeholder_entry(group: &Group) -> PoolEntry {
    PoolEntry {
        id: 0,
        group_id: group.id,
        key: String::new(),
        key_hash: String::new(),
        encrypted: String::new(),
    }
}

fn json_response(status: u16, body: serde_json::Value) -> Response {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn deny_response(
    reason: &str,
    reset_at: chrono::DateTime<chrono::Utc>,
    limit: u64,
    used: u64,
) -> Response {
    let retry_after = (reset_at - chrono::Utc::now()).num_seconds().max(0);
    let mut response = json_response(
        429,
        serde_json::json!({
            "error": reason,
            "limit": limit,
            "used": used,
            "reset_at": reset_at.to_rfc3339(),
            "request_id": uuid::Uuid::new_v4().to_string(),
        }),
    );
    if let Ok(value) = retry_after.to_string().parse() {
        response.headers_mut().insert(http::header::RETRY_AFTER, value);
    }
    response
}

fn exhausted_response(retries: u32, detail: &str) -> Response {
    json_response(
        502,
        serde_json::json!({
            "error": "upstream_unavailable",
            "retries": retries,
            "detail": detail,
            "request_id": uuid::Uuid::new_v4().to_string(),
        }),
    )
}

/// Synthetic JSON for every error the pipeline surfaces itself.
pub fn error_response(err: &GatewayError) -> Response {
    match err {
        GatewayError::RateLimited { reason, reset_at } => {
            deny_response(reason, *reset_at, 0, 0)
        }
        GatewayError::NoActiveKey(group) => json_response(
            503,
            serde_json::json!({
                "error": "no_active_key",
                "group": group,
                "request_id": uuid::Uuid::new_v4().to_string(),
            }),
        ),
        other => json_response(
            other.status_code(),
            serde_json::json!({
                "error": other.to_string(),
                "request_id": uuid::Uuid::new_v4().to_string(),
            }),
        ),
    }
}
