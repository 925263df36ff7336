use crate::handlers;
use axum::Router;
use axum::extract::State;
use axum::routing::{delete, get, post, put};
use loadgate_channel::ChannelRegistry;
use loadgate_core::config::AppConfig;
use loadgate_core::crypto::Encryptor;
use loadgate_observability::Metrics;
use loadgate_pool::KeyPool;
use loadgate_store::GroupCache;
use loadgate_store::groups::GroupRepo;
use loadgate_store::keys::KeyRepo;
use loadgate_store::kv::KvStore;
use loadgate_store::logs::LogRepo;
use loadgate_store::settings::Settings;
use loadgate_store::stats::StatsRepo;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};

/// Failed-login accounting, process-local. One mutex is plenty:
/// logins are rare and the critical section is a few integer ops.
#[derive(Debug, Default)]
pub struct LoginGuard {
    failures: u32,
    locked_until: Option<Instant>,
}

impl LoginGuard {
    /// Remaining lockout, if any.
    pub fn locked_for(&mut self) -> Option<Duration> {
        match self.locked_until {
            Some(until) if until > Instant::now() => Some(until - Instant::now()),
            Some(_) => {
                self.locked_until = None;
                self.failures = 0;
                None
            }
            None => None,
        }
    }

    pub fn record_failure(&mut self, max_attempts: u32, lockout: Duration) {
        self.failures += 1;
        if self.failures >= max_attempts {
            self.locked_until = Some(Instant::now() + lockout);
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.locked_until = None;
    }
}

/// Shared state for the admin API.
pub struct AdminState {
    pub config: Arc<AppConfig>,
    pub cache: Arc<GroupCache>,
    pub pool: Arc<KeyPool>,
    pub kv: Arc<dyn KvStore>,
    pub groups: GroupRepo,
    pub keys: KeyRepo,
    pub logs: LogRepo,
    pub stats: StatsRepo,
    pub settings: Arc<Settings>,
    pub registry: Arc<ChannelRegistry>,
    pub metrics: Arc<Metrics>,
    pub encryptor: Encryptor,
    pub login: Mutex<LoginGuard>,
    /// `group_sort_order.json` location.
    pub sort_file: PathBuf,
}

/// Build the admin router. Everything under `/api` except login is
/// behind the session-key middleware; `/health` and `/metrics` are
/// open for probes and scrapers.
pub fn admin_router(state: Arc<AdminState>) -> Router {
    let authed = Router::new()
        // Groups
        .route("/groups", get(handlers::groups::list_groups))
        .route("/groups", post(handlers::groups::create_group))
        .route("/groups/sort", put(handlers::groups::set_sort_order))
        .route("/groups/{id}", get(handlers::groups::get_group))
        .route("/groups/{id}", put(handlers::groups::update_group))
        .route("/groups/{id}", delete(handlers::groups::delete_group))
        .route("/groups/{id}/sub-groups", put(handlers::groups::set_sub_groups))
        // Keys
        .route("/groups/{id}/keys", get(handlers::keys::list_keys))
        .route("/groups/{id}/keys", post(handlers::keys::add_keys))
        .route("/groups/{id}/keys", delete(handlers::keys::delete_keys))
        .route("/groups/{id}/keys/export", get(handlers::keys::export_keys))
        // Logs
        .route("/logs", get(handlers::logs::query_logs))
        // Dashboard & settings
        .route("/dashboard", get(handlers::dashboard::summary))
        .route("/channels", get(handlers::dashboard::channels))
        .route("/settings", get(handlers::settings::get_settings))
        .route("/settings", put(handlers::settings::update_settings))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            crate::middleware::session_auth,
        ));

    let api = Router::new()
        .route("/auth/login", post(handlers::auth::login))
        .merge(authed);

    Router::new()
        .nest("/api", api)
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(cors_layer(&state.config))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<Arc<AdminState>>) -> String {
    state.metrics.gather_text()
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    let origins = config.cors_origins();
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<http::HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}
