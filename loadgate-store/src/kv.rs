use async_trait::async_trait;
use dashmap::DashMap;
use loadgate_core::GatewayError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Key layout for the pool's runtime state.
pub mod keyspace {
    pub fn active_list(group_id: i64) -> String {
        format!("keys:active:{group_id}")
    }

    pub fn invalid_set(group_id: i64) -> String {
        format!("keys:invalid:{group_id}")
    }

    pub fn fail_counter(key_id: i64) -> String {
        format!("key:fail:{key_id}")
    }

    pub fn group_meta(group_id: i64) -> String {
        format!("group:meta:{group_id}")
    }
}

/// Runtime key-value state shared by the pool, the group cache, and
/// the rate limiter. Every operation is atomic with respect to
/// concurrent callers; `rotate` in particular is a linearisable
/// head-pop/tail-push so concurrent acquirers see distinct cyclic
/// positions.
///
/// The in-memory implementation below is the default backend.
/// `KV_ADDR` is the seam for a shared store; any backend must keep
/// the same atomicity contract (single primitive or scripted
/// compound op per method).
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Increment a counter, creating it with the given TTL.
    /// The TTL window starts at creation and is not refreshed, so a
    /// burst must fit inside one window to reach a threshold.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, GatewayError>;

    async fn counter(&self, key: &str) -> Result<i64, GatewayError>;

    /// Delete a counter (success resets failure accounting).
    async fn reset(&self, key: &str) -> Result<(), GatewayError>;

    /// Pop the head of the list, push it to the tail, return it.
    /// `None` when the list is empty or absent.
    async fn rotate(&self, list: &str) -> Result<Option<String>, GatewayError>;

    /// Append if not already present. Returns false on duplicate.
    async fn list_push(&self, list: &str, member: &str) -> Result<bool, GatewayError>;

    /// Remove one occurrence. Returns whether anything was removed.
    async fn list_remove(&self, list: &str, member: &str) -> Result<bool, GatewayError>;

    async fn list_len(&self, list: &str) -> Result<usize, GatewayError>;

    async fn list_members(&self, list: &str) -> Result<Vec<String>, GatewayError>;

    /// Insert into a set. Returns false when already present.
    async fn set_add(&self, set: &str, member: &str) -> Result<bool, GatewayError>;

    async fn set_remove(&self, set: &str, member: &str) -> Result<bool, GatewayError>;

    async fn set_members(&self, set: &str) -> Result<Vec<String>, GatewayError>;

    async fn put(&self, key: &str, value: String) -> Result<(), GatewayError>;

    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError>;

    async fn delete(&self, key: &str) -> Result<(), GatewayError>;

    /// Drop a key from every namespace (counter, list, set, value).
    /// Used when a group is destroyed and its runtime state must go
    /// with the DB rows.
    async fn clear(&self, key: &str) -> Result<(), GatewayError>;
}

struct Counter {
    value: i64,
    expires_at: Instant,
}

/// Process-local [`KvStore`].
///
/// Counters and sets live in sharded maps; rotation lists share one
/// async mutex because `rotate` must observe pop and push as a single
/// step and list traffic is tiny compared to request traffic.
#[derive(Default)]
pub struct MemoryStore {
    counters: DashMap<String, Counter>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    sets: DashMap<String, HashSet<String>>,
    values: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, GatewayError> {
        let now = Instant::now();
        let mut entry = self.counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.value = 0;
            entry.expires_at = now + ttl;
        }
        entry.value += 1;
        Ok(entry.value)
    }

    async fn counter(&self, key: &str) -> Result<i64, GatewayError> {
        Ok(self
            .counters
            .get(key)
            .filter(|c| c.expires_at > Instant::now())
            .map(|c| c.value)
            .unwrap_or(0))
    }

    async fn reset(&self, key: &str) -> Result<(), GatewayError> {
        self.counters.remove(key);
        Ok(())
    }

    async fn rotate(&self, list: &str) -> Result<Option<String>, GatewayError> {
        let mut lists = self.lists.lock().await;
        let Some(queue) = lists.get_mut(list) else {
            return Ok(None);
        };
        let Some(head) = queue.pop_front() else {
            return Ok(None);
        };
        queue.push_back(head.clone());
        Ok(Some(head))
    }

    async fn list_push(&self, list: &str, member: &str) -> Result<bool, GatewayError> {
        let mut lists = self.lists.lock().await;
        let queue = lists.entry(list.to_string()).or_default();
        if queue.iter().any(|m| m == member) {
            return Ok(false);
        }
        queue.push_back(member.to_string());
        Ok(true)
    }

    async fn list_remove(&self, list: &str, member: &str) -> Result<bool, GatewayError> {
        let mut lists = self.lists.lock().await;
        let Some(queue) = lists.get_mut(list) else {
            return Ok(false);
        };
        let before = queue.len();
        queue.retain(|m| m != member);
        Ok(queue.len() != before)
    }

    async fn list_len(&self, list: &str) -> Result<usize, GatewayError> {
        Ok(self.lists.lock().await.get(list).map_or(0, VecDeque::len))
    }

    async fn list_members(&self, list: &str) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .lists
            .lock()
            .await
            .get(list)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<bool, GatewayError> {
        Ok(self
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<bool, GatewayError> {
        Ok(self
            .sets
            .get_mut(set)
            .map(|mut s| s.remove(member))
            .unwrap_or(false))
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .sets
            .get(set)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), GatewayError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        Ok(self.values.get(key).map(|v| v.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), GatewayError> {
        self.values.remove(key);
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), GatewayError> {
        self.counters.remove(key);
        self.lists.lock().await.remove(key);
        self.sets.remove(key);
        self.values.remove(key);
        Ok(())
    }
}
