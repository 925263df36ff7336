use crate::KeyPool;
use futures_util::StreamExt;
use loadgate_channel::{ChannelRegistry, ProbeOutcome};
use loadgate_core::group::pick_weighted;
use loadgate_core::key::{FailureKind, KeyStatus};
use loadgate_store::GroupCache;
use loadgate_store::keys::KeyRepo;
use loadgate_store::settings::Settings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How many active keys per group the optional health pass probes.
const ACTIVE_SAMPLE_PER_GROUP: usize = 2;

/// Periodic key revalidation.
///
/// Each cycle snapshots the invalid keys, probes them through their
/// group's channel adapter under a global concurrency cap, and
/// promotes the ones that answer 2xx. A second pass samples active
/// keys to catch silent revocation; permanent probe failures there go
/// through the normal failure accounting.
pub struct CronValidator {
    pool: Arc<KeyPool>,
    repo: KeyRepo,
    cache: Arc<GroupCache>,
    registry: Arc<ChannelRegistry>,
    settings: Arc<Settings>,
    client: reqwest::Client,
}

impl CronValidator {
    pub fn new(
        pool: Arc<KeyPool>,
        repo: KeyRepo,
        cache: Arc<GroupCache>,
        registry: Arc<ChannelRegistry>,
        settings: Arc<Settings>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            pool,
            repo,
            cache,
            registry,
            settings,
            client,
        }
    }

    /// Run until the shutdown signal flips. In-flight probes drain
    /// before the loop exits; each probe carries its own timeout so
    /// the drain is bounded.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let minutes = self.interval_minutes().await;
            debug!(minutes, "Validator sleeping until next cycle");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(minutes * 60)) => {
                    self.run_cycle().await;
                }
                _ = shutdown.changed() => {
                    info!("Validator stopping");
                    return;
                }
            }
        }
    }

    /// Cycle cadence: the longest configured per-group interval, so a
    /// slow group is never probed more often than it asked for.
    pub async fn interval_minutes(&self) -> u64 {
        let default = self.settings.snapshot().key_validation_interval_minutes;
        match self.cache.list().await {
            Ok(groups) => groups
                .iter()
                .filter_map(|g| g.config.key_validation_interval_minutes)
                .max()
                .map_or(default, |m| m.max(default)),
            Err(e) => {
                warn!(error = %e, "Validator could not list groups; using default interval");
                default
            }
        }
    }

    /// One validation pass over every invalid key, then the active
    /// sample. Errors are logged and retried next cycle.
    pub async fn run_cycle(&self) {
        let concurrency = self.settings.snapshot().key_validation_concurrency.max(1);

        let invalid = match self.repo.list_by_status(KeyStatus::Invalid).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Validator snapshot failed");
                return;
            }
        };
        info!(candidates = invalid.len(), "Validation cycle started");

        futures_util::stream::iter(invalid)
            .for_each_concurrent(concurrency, |key| async move {
                self.revalidate_one(key.id, key.group_id).await;
            })
            .await;

        self.probe_active_sample(concurrency).await;
    }

    async fn revalidate_one(&self, key_id: i64, group_id: i64) {
        let Some((outcome, _)) = self.probe(key_id, group_id).await else {
            return;
        };
        match outcome {
            ProbeOutcome::Ok => {
                if let Err(e) = self.pool.promote(key_id).await {
                    warn!(key_id, error = %e, "Promotion failed");
                }
            }
            ProbeOutcome::Permanent(reason) => {
                debug!(key_id, reason = %reason, "Key still invalid");
                if let Err(e) = self.repo.set_last_error(key_id, &reason).await {
                    warn!(key_id, error = %e, "Recording probe error failed");
                }
            }
            ProbeOutcome::Retryable(reason) => {
                debug!(key_id, reason = %reason, "Probe inconclusive; retrying next cycle");
            }
        }
    }

    /// Health pass over a small sample of active keys per group.
    /// A permanently failing probe counts as an attributable failure
    /// so threshold accounting applies.
    async fn probe_active_sample(&self, concurrency: usize) {
        let groups = match self.cache.list().await {
            Ok(groups) => groups,
            Err(_) => return,
        };
        let settings = self.settings.snapshot();

        // (key, group, threshold) triples for the sampled probes
        let mut candidates = Vec::new();
        for group in groups {
            if group.is_aggregate() {
                continue;
            }
            let threshold = group.config.effective(&settings).blacklist_threshold;
            let Ok(mut ids) = self.sample_active_ids(group.id).await else {
                continue;
            };
            ids.truncate(ACTIVE_SAMPLE_PER_GROUP);
            candidates.extend(ids.into_iter().map(|key_id| (key_id, group.id, threshold)));
        }

        futures_util::stream::iter(candidates)
            .for_each_concurrent(concurrency, |(key_id, group_id, threshold)| async move {
                if let Some((ProbeOutcome::Permanent(reason), _)) =
                    self.probe(key_id, group_id).await
                {
                    let _ = self
                        .pool
                        .report_failure(key_id, FailureKind::Permanent, &reason, threshold)
                        .await;
                }
            })
            .await;
    }

    async fn sample_active_ids(&self, group_id: i64) -> Result<Vec<i64>, loadgate_core::GatewayError> {
        use rand::seq::SliceRandom;
        let mut ids: Vec<i64> = self
            .repo
            .list_by_group(group_id)
            .await?
            .into_iter()
            .filter(|k| k.status == KeyStatus::Active)
            .map(|k| k.id)
            .collect();
        ids.shuffle(&mut rand::thread_rng());
        Ok(ids)
    }

    /// Probe one key through its group's adapter. Returns `None` when
    /// the key, group, adapter, or upstream cannot be resolved.
    async fn probe(&self, key_id: i64, group_id: i64) -> Option<(ProbeOutcome, String)> {
        let entry = self.pool.entry(key_id)?;
        let cached = self.cache.get_by_id(group_id).await.ok()?;
        let adapter = self.registry.get(&cached.group.channel_type)?;
        let upstream = pick_weighted(&cached.group.upstreams, |u| u.weight)?;
        let timeout = Duration::from_secs(
            cached
                .group
                .config
                .effective(&self.settings.snapshot())
                .key_validation_timeout_seconds,
        );
        let outcome = adapter
            .validate(&self.client, &upstream.url, &entry.key, &cached.group, timeout)
            .await;
        Some((outcome, upstream.url.clone()))
    }
}
