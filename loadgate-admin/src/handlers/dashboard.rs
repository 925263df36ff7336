use crate::server::AdminState;
use crate::{envelope_gateway_err, envelope_ok};
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use loadgate_core::key::KeyStatus;
use loadgate_core::stats::{hour_bucket, month_bucket};
use serde_json::{Value, json};
use std::sync::Arc;

/// Monitor summary: per-group key counts and current-bucket usage,
/// plus fleet totals over the last 24 hours.
pub async fn summary(State(state): State<Arc<AdminState>>) -> (StatusCode, Json<Value>) {
    let groups = match state.groups.list().await {
        Ok(groups) => groups,
        Err(e) => return envelope_gateway_err(&e),
    };
    let now = chrono::Utc::now();

    let mut rows = Vec::with_capacity(groups.len());
    for group in &groups {
        let keys = match state.keys.list_by_group(group.id).await {
            Ok(keys) => keys,
            Err(e) => return envelope_gateway_err(&e),
        };
        let active = keys.iter().filter(|k| k.status == KeyStatus::Active).count();
        let hourly = state
            .stats
            .hourly(group.id, hour_bucket(now))
            .await
            .ok()
            .flatten();
        let monthly = state
            .stats
            .monthly(group.id, month_bucket(now))
            .await
            .ok()
            .flatten();
        rows.push(json!({
            "id": group.id,
            "name": group.name,
            "channel_type": group.channel_type,
            "group_type": group.group_type,
            "sort": group.sort,
            "keys_active": active,
            "keys_invalid": keys.len() - active,
            "hour_success": hourly.as_ref().map_or(0, |s| s.success_count),
            "hour_failure": hourly.as_ref().map_or(0, |s| s.failure_count),
            "month_requests": monthly.as_ref().map_or(0, |s| s.request_count),
        }));
    }

    let (success_24h, failure_24h) = state
        .stats
        .totals_since(now - chrono::Duration::hours(24))
        .await
        .unwrap_or((0, 0));

    envelope_ok(json!({
        "groups": rows,
        "totals": { "success_24h": success_24h, "failure_24h": failure_24h },
    }))
}

pub async fn channels(State(state): State<Arc<AdminState>>) -> (StatusCode, Json<Value>) {
    envelope_ok(json!({ "list": state.registry.list() }))
}
