pub mod auth;
pub mod engine;
pub mod limiter;
pub mod relay;
pub mod routes;

use loadgate_channel::ChannelRegistry;
use loadgate_observability::{LogSender, Metrics};
use loadgate_pool::KeyPool;
use loadgate_store::GroupCache;
use loadgate_store::settings::Settings;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Everything the dispatch pipeline needs, wired once at startup.
pub struct ProxyState {
    pub cache: Arc<GroupCache>,
    pub pool: Arc<KeyPool>,
    pub registry: Arc<ChannelRegistry>,
    pub settings: Arc<Settings>,
    pub limiter: limiter::RateLimiter,
    pub logs: LogSender,
    pub metrics: Arc<Metrics>,
    pub client: reqwest::Client,
    /// Global cap on concurrently dispatched requests.
    pub concurrency: Arc<Semaphore>,
}
