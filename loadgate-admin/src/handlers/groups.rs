use crate::persist::{self, SortEntry};
use crate::server::AdminState;
use crate::{envelope_err, envelope_gateway_err, envelope_ok};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use loadgate_core::group::{Group, GroupSubGroup};
use loadgate_store::groups::GroupPatch;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

pub async fn list_groups(State(state): State<Arc<AdminState>>) -> (StatusCode, Json<Value>) {
    match state.groups.list().await {
        Ok(groups) => envelope_ok(json!({ "list": groups, "total": groups.len() })),
        Err(e) => envelope_gateway_err(&e),
    }
}

pub async fn get_group(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<i64>,
) -> (StatusCode, Json<Value>) {
    match state.groups.get_by_id(id).await {
        Ok(Some(group)) => envelope_ok(group),
        Ok(None) => envelope_err(StatusCode::NOT_FOUND, "group not found"),
        Err(e) => envelope_gateway_err(&e),
    }
}

pub async fn create_group(
    State(state): State<Arc<AdminState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let group: Group = match serde_json::from_value(body) {
        Ok(group) => group,
        Err(e) => return envelope_err(StatusCode::BAD_REQUEST, e),
    };
    if state.registry.get(&group.channel_type).is_none() {
        return envelope_err(
            StatusCode::BAD_REQUEST,
            format!("unknown channel type: {}", group.channel_type),
        );
    }
    match state.groups.create(&group).await {
        Ok(id) => {
            state.cache.invalidate();
            envelope_ok(json!({ "id": id }))
        }
        Err(e) => envelope_gateway_err(&e),
    }
}

/// Full replace of the mutable fields. The stored row keeps its id,
/// name-uniqueness, and timestamps; everything else follows the body.
pub async fn update_group(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let group: Group = match serde_json::from_value(body) {
        Ok(group) => group,
        Err(e) => return envelope_err(StatusCode::BAD_REQUEST, e),
    };
    if let Err(e) = group.validate() {
        return envelope_gateway_err(&e);
    }
    let patch = GroupPatch {
        name: Some(group.name.clone()),
        channel_type: Some(group.channel_type.clone()),
        group_type: Some(group.group_type),
        upstreams: Some(group.upstreams.clone()),
        test_model: Some(group.test_model.clone()),
        validation_endpoint: Some(group.validation_endpoint.clone()),
        param_overrides: Some(group.param_overrides.clone()),
        model_redirect_rules: Some(group.model_redirect_rules.clone()),
        model_redirect_strict: Some(group.model_redirect_strict),
        header_rules: Some(group.header_rules.clone()),
        proxy_keys: Some(group.proxy_keys.clone()),
        config: Some(group.config.clone()),
        sort: Some(group.sort),
    };
    match state.groups.update(id, &patch).await {
        Ok(()) => {
            state.cache.invalidate();
            envelope_ok(json!({ "id": id }))
        }
        Err(e) => envelope_gateway_err(&e),
    }
}

/// Destroy the group, its keys, its edges, and its runtime KV state
/// in one durability boundary, then drop it from the caches.
pub async fn delete_group(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<i64>,
) -> (StatusCode, Json<Value>) {
    match state.groups.delete(id, state.kv.as_ref()).await {
        Ok(()) => {
            state.pool.forget_group(id);
            state.cache.invalidate();
            envelope_ok(json!({ "deleted": true }))
        }
        Err(e) => envelope_gateway_err(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SubGroupBody {
    pub sub_groups: Vec<SubGroupEdge>,
}

#[derive(Debug, Deserialize)]
pub struct SubGroupEdge {
    pub sub_group_id: i64,
    #[serde(default)]
    pub weight: u32,
}

pub async fn set_sub_groups(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<i64>,
    Json(body): Json<SubGroupBody>,
) -> (StatusCode, Json<Value>) {
    let parent = match state.groups.get_by_id(id).await {
        Ok(Some(parent)) => parent,
        Ok(None) => return envelope_err(StatusCode::NOT_FOUND, "group not found"),
        Err(e) => return envelope_gateway_err(&e),
    };
    if !parent.is_aggregate() {
        return envelope_err(StatusCode::BAD_REQUEST, "group is not an aggregate");
    }
    let edges: Vec<GroupSubGroup> = body
        .sub_groups
        .iter()
        .map(|e| GroupSubGroup {
            parent_id: id,
            sub_group_id: e.sub_group_id,
            weight: e.weight,
        })
        .collect();
    match state.groups.set_sub_groups(id, &edges).await {
        Ok(()) => {
            state.cache.invalidate();
            envelope_ok(json!({ "count": edges.len() }))
        }
        Err(e) => envelope_gateway_err(&e),
    }
}

/// Persist the dashboard's drag-and-drop order: DB rows for the
/// proxy, plus the `group_sort_order.json` side document.
pub async fn set_sort_order(
    State(state): State<Arc<AdminState>>,
    Json(entries): Json<Vec<SortEntry>>,
) -> (StatusCode, Json<Value>) {
    for entry in &entries {
        let patch = GroupPatch {
            sort: Some(entry.sort),
            ..Default::default()
        };
        if let Err(e) = state.groups.update(entry.id, &patch).await {
            return envelope_gateway_err(&e);
        }
    }
    if let Err(e) = persist::save_sort_order(&state.sort_file, &entries) {
        return envelope_err(StatusCode::INTERNAL_SERVER_ERROR, e);
    }
    state.cache.invalidate();
    envelope_ok(json!({ "count": entries.len() }))
}
