use crate::groups::GroupRepo;
use crate::kv::{KvStore, keyspace};
use dashmap::DashMap;
use loadgate_core::GatewayError;
use loadgate_core::group::{Group, GroupSubGroup, pick_weighted};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// A group plus its resolved sub-group edges (empty for standard
/// groups). Cached as one unit so aggregate dispatch needs no extra
/// DB round trip.
#[derive(Debug, Clone)]
pub struct CachedGroup {
    pub group: Group,
    pub children: Vec<GroupSubGroup>,
}

/// Read-through group cache — the Group Manager.
///
/// All proxy decisions read from this cache. Invalidation is
/// explicit: every admin mutation calls `invalidate()`, which bumps
/// the version and flushes entries; in-flight readers may finish
/// with the previous value (at-most-once-stale).
pub struct GroupCache {
    repo: GroupRepo,
    kv: Arc<dyn KvStore>,
    by_name: DashMap<String, Arc<CachedGroup>>,
    by_id: DashMap<i64, Arc<CachedGroup>>,
    version: AtomicU64,
}

impl GroupCache {
    pub fn new(repo: GroupRepo, kv: Arc<dyn KvStore>) -> Self {
        Self {
            repo,
            kv,
            by_name: DashMap::new(),
            by_id: DashMap::new(),
            version: AtomicU64::new(0),
        }
    }

    /// Cold load: warm every group at startup.
    pub async fn initialize(&self) -> Result<usize, GatewayError> {
        let groups = self.repo.list().await?;
        for group in groups {
            self.insert(group).await?;
        }
        let loaded = self.by_name.len();
        info!(groups = loaded, "Group cache warmed");
        Ok(loaded)
    }

    pub async fn get(&self, name: &str) -> Result<Arc<CachedGroup>, GatewayError> {
        if let Some(cached) = self.by_name.get(name) {
            return Ok(Arc::clone(&cached));
        }
        match self.repo.get_by_name(name).await? {
            Some(group) => self.insert(group).await,
            None => Err(GatewayError::GroupNotFound(name.to_string())),
        }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Arc<CachedGroup>, GatewayError> {
        if let Some(cached) = self.by_id.get(&id) {
            return Ok(Arc::clone(&cached));
        }
        match self.repo.get_by_id(id).await? {
            Some(group) => self.insert(group).await,
            None => Err(GatewayError::GroupNotFound(id.to_string())),
        }
    }

    pub async fn list(&self) -> Result<Vec<Group>, GatewayError> {
        self.repo.list().await
    }

    /// Weighted random pick over an aggregate's eligible children.
    pub async fn pick_child(&self, parent_id: i64) -> Result<Arc<CachedGroup>, GatewayError> {
        let parent = self.get_by_id(parent_id).await?;
        let edge = pick_weighted(&parent.children, |e| e.weight).ok_or_else(|| {
            GatewayError::NoChildGroupAvailable(parent.group.name.clone())
        })?;
        self.get_by_id(edge.sub_group_id)
            .await
            .map_err(|_| GatewayError::NoChildGroupAvailable(parent.group.name.clone()))
    }

    /// Flush all entries and bump the version. Readers after this
    /// call observe fresh rows.
    pub fn invalidate(&self) {
        let v = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.by_name.clear();
        self.by_id.clear();
        debug!(version = v, "Group cache invalidated");
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Final flush on shutdown.
    pub fn stop(&self) {
        self.by_name.clear();
        self.by_id.clear();
    }

    async fn insert(&self, group: Group) -> Result<Arc<CachedGroup>, GatewayError> {
        let children = if group.is_aggregate() {
            self.repo.sub_groups(group.id).await?
        } else {
            Vec::new()
        };
        // shared KV copy for deployments with an external store
        self.kv
            .put(&keyspace::group_meta(group.id), serde_json::to_string(&group)?)
            .await?;
        let cached = Arc::new(CachedGroup { group, children });
        self.by_name
            .insert(cached.group.name.clone(), Arc::clone(&cached));
        self.by_id.insert(cached.group.id, Arc::clone(&cached));
        Ok(cached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_ephemeral;
    use crate::kv::MemoryStore;
    use std::collections::HashMap;

    async fn fixture() -> (GroupCache, GroupRepo) {
        let pool = connect_ephemeral().await.unwrap();
        let repo = GroupRepo::new(pool);
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        (GroupCache::new(repo.clone(), kv), repo)
    }

    fn standard(name: &str) -> Group {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "channel_type": "openai",
            "upstreams": [{ "url": "https://api.openai.com", "weight": 1 }],
            "test_model": "gpt-4o-mini"
        }))
        .unwrap()
    }

    fn aggregate(name: &str) -> Group {
        serde_json::from_value(serde_json::json!({
            "name": name, "channel_type": "openai", "group_type": "aggregate"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_read_through_and_unknown_group() {
        let (cache, repo) = fixture().await;
        repo.create(&standard("g1")).await.unwrap();

        let cached = cache.get("g1").await.unwrap();
        assert_eq!(cached.group.name, "g1");
        assert!(matches!(
            cache.get("nope").await,
            Err(GatewayError::GroupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalidate_reveals_new_rows() {
        let (cache, repo) = fixture().await;
        let id = repo.create(&standard("g1")).await.unwrap();
        let v0 = cache.version();

        assert_eq!(cache.get("g1").await.unwrap().group.sort, 0);

        repo.update(
            id,
            &crate::groups::GroupPatch { sort: Some(5), ..Default::default() },
        )
        .await
        .unwrap();
        // stale until invalidated
        assert_eq!(cache.get("g1").await.unwrap().group.sort, 0);

        cache.invalidate();
        assert_eq!(cache.version(), v0 + 1);
        assert_eq!(cache.get("g1").await.unwrap().group.sort, 5);
    }

    #[tokio::test]
    async fn test_initialize_warms_everything() {
        let (cache, repo) = fixture().await;
        repo.create(&standard("a")).await.unwrap();
        repo.create(&standard("b")).await.unwrap();
        assert_eq!(cache.initialize().await.unwrap(), 2);
        // served from cache even if the repo row later changes
        assert!(cache.get("a").await.is_ok());
        assert!(cache.get_by_id(cache.get("b").await.unwrap().group.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_pick_child_weighted_distribution() {
        let (cache, repo) = fixture().await;
        let parent = repo.create(&aggregate("agg")).await.unwrap();
        let b = repo.create(&standard("b")).await.unwrap();
        let c = repo.create(&standard("c")).await.unwrap();
        repo.set_sub_groups(
            parent,
            &[
                GroupSubGroup { parent_id: parent, sub_group_id: b, weight: 3 },
                GroupSubGroup { parent_id: parent, sub_group_id: c, weight: 1 },
            ],
        )
        .await
        .unwrap();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..4000 {
            let child = cache.pick_child(parent).await.unwrap();
            *counts.entry(child.group.name.clone()).or_default() += 1;
        }
        let b_count = counts["b"];
        // expectation 3000, generous band around ±2σ
        assert!((2850..=3150).contains(&b_count), "b picked {b_count}/4000");
    }

    #[tokio::test]
    async fn test_pick_child_requires_positive_weight() {
        let (cache, repo) = fixture().await;
        let parent = repo.create(&aggregate("agg")).await.unwrap();
        let b = repo.create(&standard("b")).await.unwrap();
        repo.set_sub_groups(
            parent,
            &[GroupSubGroup { parent_id: parent, sub_group_id: b, weight: 0 }],
        )
        .await
        .unwrap();

        assert!(matches!(
            cache.pick_child(parent).await,
            Err(GatewayError::NoChildGroupAvailable(_))
        ));
    }
}
