use crate::kv::{KvStore, keyspace};
use crate::store_err;
use loadgate_core::GatewayError;
use loadgate_core::key::{ApiKey, KeyStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

/// Relational access to provider keys.
#[derive(Clone)]
pub struct KeyRepo {
    pool: SqlitePool,
}

impl KeyRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Bulk insert, deduplicated on `(group_id, key_hash)`.
    /// Returns only the rows that were actually inserted.
    pub async fn insert_many(
        &self,
        group_id: i64,
        entries: &[(String, String)],
    ) -> Result<Vec<ApiKey>, GatewayError> {
        let now = chrono::Utc::now();
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let mut inserted = Vec::new();
        for (key_value, key_hash) in entries {
            let result = sqlx::query(
                r#"INSERT OR IGNORE INTO api_keys
                   (group_id, key_value, key_hash, status, failure_count, created_at)
                   VALUES (?, ?, ?, 'active', 0, ?)"#,
            )
            .bind(group_id)
            .bind(key_value)
            .bind(key_hash)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
            if result.rows_affected() == 1 {
                inserted.push(ApiKey {
                    id: result.last_insert_rowid(),
                    group_id,
                    key_value: key_value.clone(),
                    key_hash: key_hash.clone(),
                    status: KeyStatus::Active,
                    failure_count: 0,
                    last_used_at: None,
                    last_error: None,
                    created_at: now,
                });
            }
        }
        tx.commit().await.map_err(store_err)?;
        Ok(inserted)
    }

    /// Delete keys from a group. KV state for each key is purged
    /// inside the transaction window, mirroring the group delete.
    pub async fn delete_many(
        &self,
        group_id: i64,
        ids: &[i64],
        kv: &dyn KvStore,
    ) -> Result<u64, GatewayError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let mut deleted = 0u64;
        for id in ids {
            let result = sqlx::query("DELETE FROM api_keys WHERE id = ? AND group_id = ?")
                .bind(id)
                .bind(group_id)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            deleted += result.rows_affected();
        }

        for id in ids {
            let member = id.to_string();
            kv.list_remove(&keyspace::active_list(group_id), &member).await?;
            kv.set_remove(&keyspace::invalid_set(group_id), &member).await?;
            kv.clear(&keyspace::fail_counter(*id)).await?;
        }

        tx.commit().await.map_err(store_err)?;
        Ok(deleted)
    }

    pub async fn get(&self, id: i64) -> Result<Option<ApiKey>, GatewayError> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| key_from_row(&r)).transpose()
    }

    pub async fn list_by_group(&self, group_id: i64) -> Result<Vec<ApiKey>, GatewayError> {
        let rows = sqlx::query("SELECT * FROM api_keys WHERE group_id = ? ORDER BY id")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(key_from_row).collect()
    }

    pub async fn list_by_status(&self, status: KeyStatus) -> Result<Vec<ApiKey>, GatewayError> {
        let rows = sqlx::query("SELECT * FROM api_keys WHERE status = ? ORDER BY group_id, id")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(key_from_row).collect()
    }

    pub async fn all(&self) -> Result<Vec<ApiKey>, GatewayError> {
        let rows = sqlx::query("SELECT * FROM api_keys ORDER BY group_id, id")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(key_from_row).collect()
    }

    /// Persist the active→invalid transition.
    pub async fn mark_invalid(
        &self,
        id: i64,
        failure_count: i64,
        last_error: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE api_keys SET status = 'invalid', failure_count = ?, last_error = ? WHERE id = ?",
        )
        .bind(failure_count)
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// Persist the invalid→active promotion.
    pub async fn mark_active(&self, id: i64) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE api_keys SET status = 'active', failure_count = 0, last_error = NULL WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// Record a successful use: counter reset plus last_used_at.
    pub async fn touch_success(&self, id: i64) -> Result<(), GatewayError> {
        sqlx::query("UPDATE api_keys SET failure_count = 0, last_used_at = ? WHERE id = ?")
            .bind(chrono::Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    pub async fn set_failure_count(&self, id: i64, count: i64) -> Result<(), GatewayError> {
        sqlx::query("UPDATE api_keys SET failure_count = ? WHERE id = ?")
            .bind(count)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    /// Record the diagnostic of the latest permanent probe failure.
    pub async fn set_last_error(&self, id: i64, last_error: &str) -> Result<(), GatewayError> {
        sqlx::query("UPDATE api_keys SET last_error = ? WHERE id = ?")
            .bind(last_error)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

fn key_from_row(row: &SqliteRow) -> Result<ApiKey, GatewayError> {
    Ok(ApiKey {
        id: row.try_get("id").map_err(store_err)?,
        group_id: row.try_get("group_id").map_err(store_err)?,
        key_value: row.try_get("key_value").map_err(store_err)?,
        key_hash: row.try_get("key_hash").map_err(store_err)?,
        status: KeyStatus::from_str(row.try_get::<String, _>("status").map_err(store_err)?.as_str())?,
        failure_count: row.try_get("failure_count").map_err(store_err)?,
        last_used_at: row.try_get("last_used_at").map_err(store_err)?,
        last_error: row.try_get("last_error").map_err(store_err)?,
        created_at: row.try_get("created_at").map_err(store_err)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_ephemeral;
    use crate::kv::MemoryStore;

    async fn group_fixture(pool: &SqlitePool) -> i64 {
        let repo = crate::groups::GroupRepo::new(pool.clone());
        let g: loadgate_core::group::Group = serde_json::from_value(serde_json::json!({
            "name": "g1",
            "channel_type": "openai",
            "upstreams": [{ "url": "https://api.openai.com", "weight": 1 }],
            "test_model": "gpt-4o-mini"
        }))
        .unwrap();
        repo.create(&g).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_many_dedups_on_hash() {
        let pool = connect_ephemeral().await.unwrap();
        let gid = group_fixture(&pool).await;
        let repo = KeyRepo::new(pool);

        let first = repo
            .insert_many(gid, &[("enc-a".into(), "hash-a".into()), ("enc-b".into(), "hash-b".into())])
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        let second = repo
            .insert_many(gid, &[("enc-a2".into(), "hash-a".into()), ("enc-c".into(), "hash-c".into())])
            .await
            .unwrap();
        assert_eq!(second.len(), 1, "duplicate hash must be ignored");
        assert_eq!(second[0].key_hash, "hash-c");
        assert_eq!(repo.list_by_group(gid).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_status_transitions_persist() {
        let pool = connect_ephemeral().await.unwrap();
        let gid = group_fixture(&pool).await;
        let repo = KeyRepo::new(pool);
        let key = repo
            .insert_many(gid, &[("enc".into(), "h".into())])
            .await
            .unwrap()
            .remove(0);

        repo.mark_invalid(key.id, 3, "401 unauthorized").await.unwrap();
        let k = repo.get(key.id).await.unwrap().unwrap();
        assert_eq!(k.status, KeyStatus::Invalid);
        assert_eq!(k.failure_count, 3);
        assert_eq!(k.last_error.as_deref(), Some("401 unauthorized"));

        repo.mark_active(key.id).await.unwrap();
        let k = repo.get(key.id).await.unwrap().unwrap();
        assert_eq!(k.status, KeyStatus::Active);
        assert_eq!(k.failure_count, 0);
        assert!(k.last_error.is_none());
    }

    #[tokio::test]
    async fn test_touch_success_sets_last_used() {
        let pool = connect_ephemeral().await.unwrap();
        let gid = group_fixture(&pool).await;
        let repo = KeyRepo::new(pool);
        let key = repo
            .insert_many(gid, &[("enc".into(), "h".into())])
            .await
            .unwrap()
            .remove(0);
        assert!(key.last_used_at.is_none());

        repo.touch_success(key.id).await.unwrap();
        let k = repo.get(key.id).await.unwrap().unwrap();
        assert!(k.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_delete_many_scoped_to_group() {
        let pool = connect_ephemeral().await.unwrap();
        let gid = group_fixture(&pool).await;
        let repo = KeyRepo::new(pool);
        let kv = MemoryStore::new();
        let keys = repo
            .insert_many(gid, &[("a".into(), "ha".into()), ("b".into(), "hb".into())])
            .await
            .unwrap();

        for k in &keys {
            kv.list_push(&keyspace::active_list(gid), &k.id.to_string()).await.unwrap();
        }

        let deleted = repo.delete_many(gid, &[keys[0].id], &kv).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(repo.list_by_group(gid).await.unwrap().len(), 1);
        assert_eq!(kv.list_len(&keyspace::active_list(gid)).await.unwrap(), 1);

        // wrong group id deletes nothing
        let deleted = repo.delete_many(gid + 1, &[keys[1].id], &kv).await.unwrap();
        assert_eq!(deleted, 0);
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let pool = connect_ephemeral().await.unwrap();
        let gid = group_fixture(&pool).await;
        let repo = KeyRepo::new(pool);
        let keys = repo
            .insert_many(gid, &[("a".into(), "ha".into()), ("b".into(), "hb".into())])
            .await
            .unwrap();
        repo.mark_invalid(keys[0].id, 3, "revoked").await.unwrap();

        let invalid = repo.list_by_status(KeyStatus::Invalid).await.unwrap();
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].id, keys[0].id);
        assert_eq!(repo.list_by_status(KeyStatus::Active).await.unwrap().len(), 1);
    }
}
