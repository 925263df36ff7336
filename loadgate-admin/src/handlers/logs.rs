use crate::server::AdminState;
use crate::{envelope_gateway_err, envelope_ok};
use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use loadgate_store::logs::LogQuery;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct LogQueryParams {
    pub group_name: Option<String>,
    pub key_hash: Option<String>,
    pub status_code: Option<u16>,
    pub from: Option<chrono::DateTime<chrono::Utc>>,
    pub to: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    50
}

/// Filtered log query. Key values are decrypted for display — the
/// admin session already has export rights over the same material.
pub async fn query_logs(
    State(state): State<Arc<AdminState>>,
    Query(params): Query<LogQueryParams>,
) -> (StatusCode, Json<Value>) {
    let page = params.page.max(1);
    let page_size = params.page_size.clamp(1, 500);
    let query = LogQuery {
        group_name: params.group_name,
        key_hash: params.key_hash,
        status_code: params.status_code,
        from: params.from,
        to: params.to,
        limit: page_size,
        offset: (page - 1) * page_size,
    };
    match state.logs.query(&query).await {
        Ok((rows, total)) => {
            let list: Vec<Value> = rows
                .into_iter()
                .map(|log| {
                    let key_plain = state.encryptor.decrypt(&log.key_value).unwrap_or_default();
                    json!({
                        "id": log.id,
                        "timestamp": log.timestamp,
                        "group_name": log.group_name,
                        "upstream_url": log.upstream_url,
                        "key_hash": log.key_hash,
                        "key": key_plain,
                        "model": log.model,
                        "status_code": log.status_code,
                        "duration_ms": log.duration_ms,
                        "is_stream": log.is_stream,
                        "retries": log.retries,
                        "error_message": log.error_message,
                    })
                })
                .collect();
            envelope_ok(json!({ "list": list, "total": total, "page": page, "page_size": page_size }))
        }
        Err(e) => envelope_gateway_err(&e),
    }
}
