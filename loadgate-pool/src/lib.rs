pub mod validator;

use dashmap::DashMap;
use loadgate_core::GatewayError;
use loadgate_core::crypto::{Encryptor, hash_key};
use loadgate_core::key::{ApiKey, FailureKind, KeyStatus};
use loadgate_store::keys::KeyRepo;
use loadgate_store::kv::{KvStore, keyspace};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Window inside which attributable failures accumulate toward the
/// blacklist threshold. A long-idle key starts a fresh window.
const FAIL_COUNTER_TTL: Duration = Duration::from_secs(3600);

/// A pool member handed to the proxy engine. Holds the decrypted key
/// so the hot path never touches the DB.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub id: i64,
    pub group_id: i64,
    /// Decrypted provider credential.
    pub key: String,
    pub key_hash: String,
    /// Ciphertext as stored, reused verbatim in request logs.
    pub encrypted: String,
}

/// Per-group rotation of provider keys.
///
/// Membership lives in the KV store (`keys:active:{g}` list,
/// `keys:invalid:{g}` set, `key:fail:{k}` counters); decrypted key
/// material lives in an in-process map populated from the DB. Status
/// transitions gate on the KV primitive's return value, so two
/// concurrent failures cannot demote the same key twice.
pub struct KeyPool {
    kv: Arc<dyn KvStore>,
    repo: KeyRepo,
    encryptor: Encryptor,
    entries: DashMap<i64, Arc<PoolEntry>>,
}

impl KeyPool {
    pub fn new(kv: Arc<dyn KvStore>, repo: KeyRepo, encryptor: Encryptor) -> Self {
        Self {
            kv,
            repo,
            encryptor,
            entries: DashMap::new(),
        }
    }

    /// Master startup: rebuild KV membership and the entry map from
    /// the DB. Keys that fail to decrypt are skipped and logged; one
    /// corrupt row must not take down the whole pool.
    pub async fn load_from_db(&self) -> Result<usize, GatewayError> {
        let keys = self.repo.all().await?;
        let mut loaded = 0usize;
        for key in keys {
            let plain = match self.encryptor.decrypt(&key.key_value) {
                Ok(plain) => plain,
                Err(e) => {
                    warn!(key_id = key.id, error = %e, "Skipping undecryptable key");
                    continue;
                }
            };
            let member = key.id.to_string();
            match key.status {
                KeyStatus::Active => {
                    self.kv
                        .list_push(&keyspace::active_list(key.group_id), &member)
                        .await?;
                }
                KeyStatus::Invalid => {
                    self.kv
                        .set_add(&keyspace::invalid_set(key.group_id), &member)
                        .await?;
                }
            }
            self.entries.insert(
                key.id,
                Arc::new(PoolEntry {
                    id: key.id,
                    group_id: key.group_id,
                    key: plain,
                    key_hash: key.key_hash.clone(),
                    encrypted: key.key_value.clone(),
                }),
            );
            loaded += 1;
        }
        info!(keys = loaded, "Key pool loaded from DB");
        Ok(loaded)
    }

    /// Round-robin selection: atomically pop the head of the active
    /// list and push it to the tail. Concurrent callers land on
    /// distinct cyclic positions.
    pub async fn acquire(&self, group_id: i64) -> Result<Arc<PoolEntry>, GatewayError> {
        let list = keyspace::active_list(group_id);
        // ids whose entry is gone (rolled-back load, deleted key) are
        // dropped from rotation and the next position is tried
        let budget = self.kv.list_len(&list).await?.max(1);
        for _ in 0..budget {
            let Some(member) = self.kv.rotate(&list).await? else {
                break;
            };
            let Ok(id) = member.parse::<i64>() else {
                self.kv.list_remove(&list, &member).await?;
                continue;
            };
            if let Some(entry) = self.entries.get(&id) {
                return Ok(Arc::clone(&entry));
            }
            self.kv.list_remove(&list, &member).await?;
        }
        Err(GatewayError::NoActiveKey(group_id.to_string()))
    }

    /// Success resets the failure window and stamps `last_used_at`.
    pub async fn report_success(&self, key_id: i64) -> Result<(), GatewayError> {
        self.kv.reset(&keyspace::fail_counter(key_id)).await?;
        self.repo.touch_success(key_id).await
    }

    /// Failure accounting. Transient kinds never count toward the
    /// threshold. Returns true when this report demoted the key.
    pub async fn report_failure(
        &self,
        key_id: i64,
        kind: FailureKind,
        error: &str,
        threshold: u32,
    ) -> Result<bool, GatewayError> {
        if !kind.is_attributable() {
            return Ok(false);
        }
        let count = self
            .kv
            .incr(&keyspace::fail_counter(key_id), FAIL_COUNTER_TTL)
            .await?;
        if count < threshold as i64 {
            self.repo.set_failure_count(key_id, count).await?;
            return Ok(false);
        }

        let Some(entry) = self.entries.get(&key_id).map(|e| Arc::clone(&e)) else {
            return Ok(false);
        };
        // list_remove returns true for exactly one concurrent caller;
        // losers see an already-demoted key and stop here
        let removed = self
            .kv
            .list_remove(&keyspace::active_list(entry.group_id), &key_id.to_string())
            .await?;
        if !removed {
            return Ok(false);
        }
        self.kv
            .set_add(&keyspace::invalid_set(entry.group_id), &key_id.to_string())
            .await?;
        self.repo.mark_invalid(key_id, count, error).await?;
        warn!(
            key_id,
            group_id = entry.group_id,
            failures = count,
            kind = kind.as_str(),
            "Key demoted to invalid"
        );
        Ok(true)
    }

    /// invalid → active, called by the validator. The set removal is
    /// the exactly-once gate, mirroring demotion.
    pub async fn promote(&self, key_id: i64) -> Result<bool, GatewayError> {
        let Some(entry) = self.entries.get(&key_id).map(|e| Arc::clone(&e)) else {
            return Err(GatewayError::KeyNotFound(key_id.to_string()));
        };
        let removed = self
            .kv
            .set_remove(&keyspace::invalid_set(entry.group_id), &key_id.to_string())
            .await?;
        if !removed {
            return Ok(false);
        }
        self.kv.reset(&keyspace::fail_counter(key_id)).await?;
        self.kv
            .list_push(&keyspace::active_list(entry.group_id), &key_id.to_string())
            .await?;
        self.repo.mark_active(key_id).await?;
        info!(key_id, group_id = entry.group_id, "Key promoted to active");
        Ok(true)
    }

    /// Bulk import from the admin surface. Plaintext keys are
    /// encrypted, hashed, deduplicated against `(group, hash)`, and
    /// pushed straight into rotation.
    pub async fn add_keys(
        &self,
        group_id: i64,
        plaintext_keys: &[String],
    ) -> Result<Vec<ApiKey>, GatewayError> {
        let mut rows = Vec::with_capacity(plaintext_keys.len());
        for plain in plaintext_keys {
            let trimmed = plain.trim();
            if trimmed.is_empty() {
                continue;
            }
            rows.push((self.encryptor.encrypt(trimmed)?, hash_key(trimmed), trimmed.to_string()));
        }
        let db_rows: Vec<(String, String)> = rows
            .iter()
            .map(|(enc, hash, _)| (enc.clone(), hash.clone()))
            .collect();
        let inserted = self.repo.insert_many(group_id, &db_rows).await?;

        for key in &inserted {
            let plain = rows
                .iter()
                .find(|(_, hash, _)| *hash == key.key_hash)
                .map(|(_, _, plain)| plain.clone())
                .unwrap_or_default();
            self.entries.insert(
                key.id,
                Arc::new(PoolEntry {
                    id: key.id,
                    group_id,
                    key: plain,
                    key_hash: key.key_hash.clone(),
                    encrypted: key.key_value.clone(),
                }),
            );
            self.kv
                .list_push(&keyspace::active_list(group_id), &key.id.to_string())
                .await?;
        }
        Ok(inserted)
    }

    /// Bulk removal; the repo purges KV membership inside the delete
    /// transaction so no stale id survives in rotation.
    pub async fn remove_keys(&self, group_id: i64, key_ids: &[i64]) -> Result<u64, GatewayError> {
        let deleted = self.repo.delete_many(group_id, key_ids, self.kv.as_ref()).await?;
        for id in key_ids {
            self.entries.remove(id);
        }
        Ok(deleted)
    }

    /// Forget a whole group's entries after the group row is gone.
    pub fn forget_group(&self, group_id: i64) {
        self.entries.retain(|_, entry| entry.group_id != group_id);
    }

    pub async fn active_count(&self, group_id: i64) -> Result<usize, GatewayError> {
        self.kv.list_len(&keyspace::active_list(group_id)).await
    }

    pub async fn invalid_ids(&self, group_id: i64) -> Result<Vec<i64>, GatewayError> {
        let members = self.kv.set_members(&keyspace::invalid_set(group_id)).await?;
        Ok(members.iter().filter_map(|m| m.parse().ok()).collect())
    }

    /// Decrypted view of one member, if known.
    pub fn entry(&self, key_id: i64) -> Option<Arc<PoolEntry>> {
        self.entries.get(&key_id).map(|e| Arc::clone(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadgate_store::db::connect_ephemeral;
    use loadgate_store::groups::GroupRepo;
    use loadgate_store::kv::MemoryStore;
    use std::collections::HashMap;

    async fn fixture() -> (Arc<KeyPool>, KeyRepo, i64) {
        let pool = connect_ephemeral().await.unwrap();
        let groups = GroupRepo::new(pool.clone());
        let g: loadgate_core::group::Group = serde_json::from_value(serde_json::json!({
            "name": "g1",
            "channel_type": "openai",
            "upstreams": [{ "url": "https://api.openai.com", "weight": 1 }],
            "test_model": "gpt-4o-mini"
        }))
        .unwrap();
        let gid = groups.create(&g).await.unwrap();
        let repo = KeyRepo::new(pool);
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let key_pool = Arc::new(KeyPool::new(
            kv,
            repo.clone(),
            Encryptor::new("pool-test-secret").unwrap(),
        ));
        (key_pool, repo, gid)
    }

    #[tokio::test]
    async fn test_add_keys_encrypts_and_rotates() {
        let (pool, repo, gid) = fixture().await;
        let inserted = pool
            .add_keys(gid, &["sk-AAA".into(), "sk-BBB".into(), "  ".into()])
            .await
            .unwrap();
        assert_eq!(inserted.len(), 2, "blank entries are skipped");
        assert_eq!(pool.active_count(gid).await.unwrap(), 2);

        // at rest: ciphertext, not plaintext
        let stored = repo.list_by_group(gid).await.unwrap();
        assert!(stored.iter().all(|k| k.key_value != "sk-AAA"));

        // acquire returns decrypted material
        let entry = pool.acquire(gid).await.unwrap();
        assert!(entry.key.starts_with("sk-"));
    }

    #[tokio::test]
    async fn test_add_keys_dedups_by_hash() {
        let (pool, _, gid) = fixture().await;
        pool.add_keys(gid, &["sk-AAA".into()]).await.unwrap();
        let second = pool.add_keys(gid, &["sk-AAA".into(), "sk-CCC".into()]).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(pool.active_count(gid).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_acquire_round_robin() {
        let (pool, _, gid) = fixture().await;
        pool.add_keys(gid, &["sk-A".into(), "sk-B".into(), "sk-C".into()])
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(pool.acquire(gid).await.unwrap().key.clone());
        }
        assert_eq!(seen[0..3], seen[3..6], "rotation must repeat cyclically");
        let distinct: std::collections::HashSet<_> = seen[0..3].iter().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[tokio::test]
    async fn test_acquire_empty_pool() {
        let (pool, _, gid) = fixture().await;
        assert!(matches!(
            pool.acquire(gid).await,
            Err(GatewayError::NoActiveKey(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_is_fair() {
        let (pool, _, gid) = fixture().await;
        pool.add_keys(gid, &["sk-A".into(), "sk-B".into(), "sk-C".into(), "sk-D".into()])
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                let mut picks = Vec::new();
                for _ in 0..25 {
                    picks.push(pool.acquire(gid).await.unwrap().key_hash.clone());
                }
                picks
            }));
        }
        let mut counts: HashMap<String, usize> = HashMap::new();
        for h in handles {
            for pick in h.await.unwrap() {
                *counts.entry(pick).or_default() += 1;
            }
        }
        // 200 acquisitions over 4 keys: exactly 50 each
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&n| n == 50), "counts: {counts:?}");
    }

    #[tokio::test]
    async fn test_transient_failures_never_demote() {
        let (pool, repo, gid) = fixture().await;
        let key = pool.add_keys(gid, &["sk-A".into()]).await.unwrap().remove(0);

        for _ in 0..10 {
            let demoted = pool
                .report_failure(key.id, FailureKind::Transient, "timeout", 3)
                .await
                .unwrap();
            assert!(!demoted);
        }
        assert_eq!(pool.active_count(gid).await.unwrap(), 1);
        assert_eq!(
            repo.get(key.id).await.unwrap().unwrap().status,
            KeyStatus::Active
        );
    }

    #[tokio::test]
    async fn test_attributable_failures_demote_at_threshold() {
        let (pool, repo, gid) = fixture().await;
        let keys = pool.add_keys(gid, &["sk-A".into(), "sk-B".into()]).await.unwrap();
        let k1 = keys[0].id;

        assert!(!pool.report_failure(k1, FailureKind::Auth, "401", 3).await.unwrap());
        assert!(!pool.report_failure(k1, FailureKind::Auth, "401", 3).await.unwrap());
        assert!(pool.report_failure(k1, FailureKind::Auth, "401", 3).await.unwrap());

        assert_eq!(pool.active_count(gid).await.unwrap(), 1);
        assert_eq!(pool.invalid_ids(gid).await.unwrap(), vec![k1]);
        let stored = repo.get(k1).await.unwrap().unwrap();
        assert_eq!(stored.status, KeyStatus::Invalid);
        assert_eq!(stored.last_error.as_deref(), Some("401"));

        // the survivor keeps serving
        assert_eq!(pool.acquire(gid).await.unwrap().id, keys[1].id);

        // further failures are no-ops on status
        assert!(!pool.report_failure(k1, FailureKind::Auth, "401", 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_success_resets_failure_window() {
        let (pool, _, gid) = fixture().await;
        let key = pool.add_keys(gid, &["sk-A".into()]).await.unwrap().remove(0);

        pool.report_failure(key.id, FailureKind::Auth, "401", 3).await.unwrap();
        pool.report_failure(key.id, FailureKind::Auth, "401", 3).await.unwrap();
        pool.report_success(key.id).await.unwrap();
        // two more failures stay below the threshold again
        assert!(!pool.report_failure(key.id, FailureKind::Auth, "401", 3).await.unwrap());
        assert!(!pool.report_failure(key.id, FailureKind::Auth, "401", 3).await.unwrap());
        assert_eq!(pool.active_count(gid).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_demotion_is_exactly_once() {
        let (pool, _, gid) = fixture().await;
        let key = pool.add_keys(gid, &["sk-A".into()]).await.unwrap().remove(0);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.report_failure(key.id, FailureKind::Auth, "401", 3)
                    .await
                    .unwrap()
            }));
        }
        let mut transitions = 0;
        for h in handles {
            if h.await.unwrap() {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 1, "exactly one report may observe the transition");
        assert_eq!(pool.invalid_ids(gid).await.unwrap(), vec![key.id]);
    }

    #[tokio::test]
    async fn test_promote_restores_rotation() {
        let (pool, repo, gid) = fixture().await;
        let key = pool.add_keys(gid, &["sk-A".into()]).await.unwrap().remove(0);
        for _ in 0..3 {
            pool.report_failure(key.id, FailureKind::Auth, "401", 3).await.unwrap();
        }
        assert!(matches!(pool.acquire(gid).await, Err(GatewayError::NoActiveKey(_))));

        assert!(pool.promote(key.id).await.unwrap());
        assert!(!pool.promote(key.id).await.unwrap(), "second promote is a no-op");

        assert_eq!(pool.acquire(gid).await.unwrap().id, key.id);
        let stored = repo.get(key.id).await.unwrap().unwrap();
        assert_eq!(stored.status, KeyStatus::Active);
        assert_eq!(stored.failure_count, 0);

        // demote → promote leaves membership and counters as before
        assert_eq!(pool.invalid_ids(gid).await.unwrap(), Vec::<i64>::new());
    }

    #[tokio::test]
    async fn test_remove_keys_drops_from_rotation() {
        let (pool, _, gid) = fixture().await;
        let keys = pool.add_keys(gid, &["sk-A".into(), "sk-B".into()]).await.unwrap();
        let removed = pool.remove_keys(gid, &[keys[0].id]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(pool.active_count(gid).await.unwrap(), 1);
        for _ in 0..4 {
            assert_eq!(pool.acquire(gid).await.unwrap().id, keys[1].id);
        }
    }

    #[tokio::test]
    async fn test_load_from_db_rebuilds_membership() {
        let (pool, repo, gid) = fixture().await;
        let keys = pool.add_keys(gid, &["sk-A".into(), "sk-B".into()]).await.unwrap();
        repo.mark_invalid(keys[1].id, 3, "revoked").await.unwrap();

        // a fresh pool instance over the same DB and a fresh KV
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let rebuilt = KeyPool::new(kv, repo, Encryptor::new("pool-test-secret").unwrap());
        assert_eq!(rebuilt.load_from_db().await.unwrap(), 2);
        assert_eq!(rebuilt.active_count(gid).await.unwrap(), 1);
        assert_eq!(rebuilt.invalid_ids(gid).await.unwrap(), vec![keys[1].id]);
        assert_eq!(rebuilt.acquire(gid).await.unwrap().key, "sk-A");
    }
}
