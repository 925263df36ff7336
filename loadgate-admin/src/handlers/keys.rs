use crate::server::AdminState;
use crate::{envelope_err, envelope_gateway_err, envelope_ok};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct AddKeysBody {
    /// Newline/whitespace-separated plaintext keys, as pasted.
    pub keys: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteKeysBody {
    pub ids: Vec<i64>,
}

pub async fn list_keys(
    State(state): State<Arc<AdminState>>,
    Path(group_id): Path<i64>,
) -> (StatusCode, Json<Value>) {
    match state.keys.list_by_group(group_id).await {
        Ok(keys) => {
            // fingerprint and status only; never the ciphertext
            let list: Vec<Value> = keys
                .iter()
                .map(|k| {
                    json!({
                        "id": k.id,
                        "key_hash": k.key_hash,
                        "status": k.status,
                        "failure_count": k.failure_count,
                        "last_used_at": k.last_used_at,
                        "last_error": k.last_error,
                        "created_at": k.created_at,
                    })
                })
                .collect();
            envelope_ok(json!({ "list": list, "total": list.len() }))
        }
        Err(e) => envelope_gateway_err(&e),
    }
}

/// Bulk import. Deduplication happens on the key fingerprint, so
/// pasting the same blob twice is harmless.
pub async fn add_keys(
    State(state): State<Arc<AdminState>>,
    Path(group_id): Path<i64>,
    Json(body): Json<AddKeysBody>,
) -> (StatusCode, Json<Value>) {
    if state.groups.get_by_id(group_id).await.ok().flatten().is_none() {
        return envelope_err(StatusCode::NOT_FOUND, "group not found");
    }
    let keys: Vec<String> = body.keys.split_whitespace().map(str::to_string).collect();
    if keys.is_empty() {
        return envelope_err(StatusCode::BAD_REQUEST, "no keys provided");
    }
    match state.pool.add_keys(group_id, &keys).await {
        Ok(inserted) => envelope_ok(json!({
            "submitted": keys.len(),
            "added": inserted.len(),
            "duplicates": keys.len() - inserted.len(),
        })),
        Err(e) => envelope_gateway_err(&e),
    }
}

pub async fn delete_keys(
    State(state): State<Arc<AdminState>>,
    Path(group_id): Path<i64>,
    Json(body): Json<DeleteKeysBody>,
) -> (StatusCode, Json<Value>) {
    match state.pool.remove_keys(group_id, &body.ids).await {
        Ok(deleted) => envelope_ok(json!({ "deleted": deleted })),
        Err(e) => envelope_gateway_err(&e),
    }
}

/// Decrypted export for operators. Auth-gated like everything else
/// here; the session holder is already trusted with the store.
pub async fn export_keys(
    State(state): State<Arc<AdminState>>,
    Path(group_id): Path<i64>,
) -> (StatusCode, Json<Value>) {
    let keys = match state.keys.list_by_group(group_id).await {
        Ok(keys) => keys,
        Err(e) => return envelope_gateway_err(&e),
    };
    let mut exported = Vec::with_capacity(keys.len());
    for key in keys {
        match state.encryptor.decrypt(&key.key_value) {
            Ok(plain) => exported.push(json!({
                "id": key.id,
                "key": plain,
                "status": key.status,
            })),
            Err(e) => {
                tracing::warn!(key_id = key.id, error = %e, "Export skipped undecryptable key");
            }
        }
    }
    envelope_ok(json!({ "list": exported, "total": exported.len() }))
}
