use crate::kv::{KvStore, keyspace};
use crate::store_err;
use loadgate_core::GatewayError;
use loadgate_core::group::{Group, GroupSubGroup, GroupType, HeaderRule, UpstreamTarget};
use loadgate_core::group_config::GroupConfig;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;

/// Relational access to groups and their sub-group edges.
#[derive(Clone)]
pub struct GroupRepo {
    pool: SqlitePool,
}

/// Selective update. `None` leaves the column untouched, which keeps
/// an explicit zero/empty value distinguishable from "not provided".
#[derive(Debug, Default, Clone)]
pub struct GroupPatch {
    pub name: Option<String>,
    pub channel_type: Option<String>,
    pub group_type: Option<GroupType>,
    pub upstreams: Option<Vec<UpstreamTarget>>,
    pub test_model: Option<String>,
    /// Outer layer = provided?, inner = nullable column value.
    pub validation_endpoint: Option<Option<String>>,
    pub param_overrides: Option<HashMap<String, serde_json::Value>>,
    pub model_redirect_rules: Option<HashMap<String, String>>,
    pub model_redirect_strict: Option<bool>,
    pub header_rules: Option<Vec<HeaderRule>>,
    pub proxy_keys: Option<String>,
    pub config: Option<GroupConfig>,
    pub sort: Option<i32>,
}

impl GroupRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, group: &Group) -> Result<i64, GatewayError> {
        group.validate()?;
        group.config.validate()?;
        let now = chrono::Utc::now();
        let result = sqlx::query(
            r#"INSERT INTO groups
               (name, channel_type, group_type, upstreams, test_model, validation_endpoint,
                param_overrides, model_redirect_rules, model_redirect_strict, header_rules,
                proxy_keys, config, sort, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&group.name)
        .bind(&group.channel_type)
        .bind(group.group_type.as_str())
        .bind(serde_json::to_string(&group.upstreams)?)
        .bind(&group.test_model)
        .bind(&group.validation_endpoint)
        .bind(serde_json::to_string(&group.param_overrides)?)
        .bind(serde_json::to_string(&group.model_redirect_rules)?)
        .bind(group.model_redirect_strict)
        .bind(serde_json::to_string(&group.header_rules)?)
        .bind(&group.proxy_keys)
        .bind(serde_json::to_string(&group.config)?)
        .bind(group.sort)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update(&self, id: i64, patch: &GroupPatch) -> Result<(), GatewayError> {
        if let Some(config) = &patch.config {
            config.validate()?;
        }
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE groups SET updated_at = ");
        qb.push_bind(chrono::Utc::now());
        if let Some(v) = &patch.name {
            qb.push(", name = ").push_bind(v);
        }
        if let Some(v) = &patch.channel_type {
            qb.push(", channel_type = ").push_bind(v);
        }
        if let Some(v) = &patch.group_type {
            qb.push(", group_type = ").push_bind(v.as_str());
        }
        if let Some(v) = &patch.upstreams {
            qb.push(", upstreams = ").push_bind(serde_json::to_string(v)?);
        }
        if let Some(v) = &patch.test_model {
            qb.push(", test_model = ").push_bind(v);
        }
        if let Some(v) = &patch.validation_endpoint {
            qb.push(", validation_endpoint = ").push_bind(v.clone());
        }
        if let Some(v) = &patch.param_overrides {
            qb.push(", param_overrides = ").push_bind(serde_json::to_string(v)?);
        }
        if let Some(v) = &patch.model_redirect_rules {
            qb.push(", model_redirect_rules = ").push_bind(serde_json::to_string(v)?);
        }
        if let Some(v) = patch.model_redirect_strict {
            qb.push(", model_redirect_strict = ").push_bind(v);
        }
        if let Some(v) = &patch.header_rules {
            qb.push(", header_rules = ").push_bind(serde_json::to_string(v)?);
        }
        if let Some(v) = &patch.proxy_keys {
            qb.push(", proxy_keys = ").push_bind(v);
        }
        if let Some(v) = &patch.config {
            qb.push(", config = ").push_bind(serde_json::to_string(v)?);
        }
        if let Some(v) = patch.sort {
            qb.push(", sort = ").push_bind(v);
        }
        qb.push(" WHERE id = ").push_bind(id);

        let result = qb.build().execute(&self.pool).await.map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::GroupNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Destroy a group, its keys, and its edges. The KV purge happens
    /// inside the transaction window: a KV failure rolls the whole
    /// delete back so no stale key id survives in rotation.
    pub async fn delete(&self, id: i64, kv: &dyn KvStore) -> Result<(), GatewayError> {
        let key_ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM api_keys WHERE group_id = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        let mut tx = self.pool.begin().await.map_err(store_err)?;
        sqlx::query("DELETE FROM api_keys WHERE group_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        sqlx::query("DELETE FROM group_sub_groups WHERE parent_id = ? OR sub_group_id = ?")
            .bind(id)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        let result = sqlx::query("DELETE FROM groups WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::GroupNotFound(id.to_string()));
        }

        // KV removal before commit; an error here drops tx (rollback).
        kv.clear(&keyspace::active_list(id)).await?;
        kv.clear(&keyspace::invalid_set(id)).await?;
        kv.clear(&keyspace::group_meta(id)).await?;
        for key_id in key_ids {
            kv.clear(&keyspace::fail_counter(key_id)).await?;
        }

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Group>, GatewayError> {
        let row = sqlx::query("SELECT * FROM groups WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| group_from_row(&r)).transpose()
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Group>, GatewayError> {
        let row = sqlx::query("SELECT * FROM groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| group_from_row(&r)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Group>, GatewayError> {
        let rows = sqlx::query("SELECT * FROM groups ORDER BY sort, name")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(group_from_row).collect()
    }

    pub async fn sub_groups(&self, parent_id: i64) -> Result<Vec<GroupSubGroup>, GatewayError> {
        let rows = sqlx::query(
            "SELECT parent_id, sub_group_id, weight FROM group_sub_groups WHERE parent_id = ?",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter()
            .map(|r| {
                Ok(GroupSubGroup {
                    parent_id: r.try_get("parent_id").map_err(store_err)?,
                    sub_group_id: r.try_get("sub_group_id").map_err(store_err)?,
                    weight: r.try_get::<i64, _>("weight").map_err(store_err)? as u32,
                })
            })
            .collect()
    }

    /// Replace an aggregate's edge set atomically.
    pub async fn set_sub_groups(
        &self,
        parent_id: i64,
        edges: &[GroupSubGroup],
    ) -> Result<(), GatewayError> {
        for edge in edges {
            if edge.sub_group_id == parent_id {
                return Err(GatewayError::Validation(
                    "aggregate group cannot contain itself".into(),
                ));
            }
        }
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        sqlx::query("DELETE FROM group_sub_groups WHERE parent_id = ?")
            .bind(parent_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        for edge in edges {
            sqlx::query(
                "INSERT INTO group_sub_groups (parent_id, sub_group_id, weight) VALUES (?, ?, ?)",
            )
            .bind(parent_id)
            .bind(edge.sub_group_id)
            .bind(edge.weight as i64)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }
}

fn group_from_row(row: &SqliteRow) -> Result<Group, GatewayError> {
    let json_err = |e: serde_json::Error| GatewayError::StoreError(e.to_string());
    Ok(Group {
        id: row.try_get("id").map_err(store_err)?,
        name: row.try_get("name").map_err(store_err)?,
        channel_type: row.try_get("channel_type").map_err(store_err)?,
        group_type: GroupType::from_str(row.try_get::<String, _>("group_type").map_err(store_err)?.as_str())?,
        upstreams: serde_json::from_str(row.try_get::<String, _>("upstreams").map_err(store_err)?.as_str())
            .map_err(json_err)?,
        test_model: row.try_get("test_model").map_err(store_err)?,
        validation_endpoint: row.try_get("validation_endpoint").map_err(store_err)?,
        param_overrides: serde_json::from_str(
            row.try_get::<String, _>("param_overrides").map_err(store_err)?.as_str(),
        )
        .map_err(json_err)?,
        model_redirect_rules: serde_json::from_str(
            row.try_get::<String, _>("model_redirect_rules").map_err(store_err)?.as_str(),
        )
        .map_err(json_err)?,
        model_redirect_strict: row.try_get("model_redirect_strict").map_err(store_err)?,
        header_rules: serde_json::from_str(
            row.try_get::<String, _>("header_rules").map_err(store_err)?.as_str(),
        )
        .map_err(json_err)?,
        proxy_keys: row.try_get("proxy_keys").map_err(store_err)?,
        config: serde_json::from_str(row.try_get::<String, _>("config").map_err(store_err)?.as_str())
            .map_err(json_err)?,
        sort: row.try_get("sort").map_err(store_err)?,
        created_at: row.try_get("created_at").map_err(store_err)?,
        updated_at: row.try_get("updated_at").map_err(store_err)?,
    })
}
