// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  loadgate — multi-tenant key-pooling proxy for AI provider APIs
//
//  Data plane:  axum streaming relay over a shared reqwest pool
//  Admin API:   axum REST, session-key auth
//  State:       SQLite (sqlx) + in-process KV for pool rotation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use clap::Parser;
use loadgate_admin::server::{AdminState, LoginGuard, admin_router};
use loadgate_channel::{ChannelRegistry, register_all};
use loadgate_core::config::AppConfig;
use loadgate_core::crypto::Encryptor;
use loadgate_observability::{LogCleaner, LogPipeline, Metrics};
use loadgate_pool::KeyPool;
use loadgate_pool::validator::CronValidator;
use loadgate_proxy::limiter::RateLimiter;
use loadgate_proxy::{ProxyState, routes};
use loadgate_store::groups::GroupRepo;
use loadgate_store::keys::KeyRepo;
use loadgate_store::kv::{KvStore, MemoryStore};
use loadgate_store::logs::LogRepo;
use loadgate_store::settings::Settings;
use loadgate_store::stats::StatsRepo;
use loadgate_store::{GroupCache, connect, migrate};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "loadgate", version, about = "Multi-tenant key-pooling proxy for AI provider APIs")]
struct Cli {
    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Location of the group sort-order document
    #[arg(long, default_value = "group_sort_order.json")]
    sort_file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    // ── Config (env) ──
    let config = Arc::new(AppConfig::load()?);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        is_master = config.is_master,
        "loadgate starting"
    );

    // ── Leaf-first component graph ──
    let db = connect(&config.db_dsn).await?;
    if config.is_master {
        migrate(&db).await?;
    }

    let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    if config.kv_addr.is_some() {
        warn!("KV_ADDR is set but this build ships the in-memory store; rotation state is node-local");
    }

    let encryptor = Encryptor::new(&config.encryption_key)?;
    let groups = GroupRepo::new(db.clone());
    let keys = KeyRepo::new(db.clone());
    let logs = LogRepo::new(db.clone());
    let stats = StatsRepo::new(db.clone());
    let settings = Arc::new(Settings::load(db.clone()).await?);

    let pool = Arc::new(KeyPool::new(Arc::clone(&kv), keys.clone(), encryptor.clone()));
    let cache = Arc::new(GroupCache::new(groups.clone(), Arc::clone(&kv)));

    let mut registry = ChannelRegistry::new();
    register_all(&mut registry);
    let registry = Arc::new(registry);
    info!(channels = registry.len(), "Channel adapters registered");

    let metrics = Arc::new(Metrics::new());
    let pipeline = Arc::new(LogPipeline::new(
        logs.clone(),
        stats.clone(),
        Arc::clone(&metrics),
        config.log_queue_capacity,
        config.log_batch_size,
        Duration::from_millis(config.log_flush_interval_ms),
    ));

    let snapshot = settings.snapshot();
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(snapshot.connect_timeout_seconds))
        .pool_idle_timeout(Duration::from_secs(snapshot.idle_conn_timeout_seconds))
        .build()?;

    // cold load: cache + pool rotation state. The KV store is
    // node-local, so every node that serves traffic loads its own.
    cache.initialize().await?;
    let loaded = pool.load_from_db().await?;
    info!(keys = loaded, "Pool ready");

    let proxy_state = Arc::new(ProxyState {
        cache: Arc::clone(&cache),
        pool: Arc::clone(&pool),
        registry: Arc::clone(&registry),
        settings: Arc::clone(&settings),
        limiter: RateLimiter::new(stats.clone(), Arc::clone(&settings)),
        logs: pipeline.sender(),
        metrics: Arc::clone(&metrics),
        client: client.clone(),
        concurrency: Arc::new(Semaphore::new(config.max_concurrent_requests)),
    });

    let admin_state = Arc::new(AdminState {
        config: Arc::clone(&config),
        cache: Arc::clone(&cache),
        pool: Arc::clone(&pool),
        kv: Arc::clone(&kv),
        groups,
        keys: keys.clone(),
        logs: logs.clone(),
        stats,
        settings: Arc::clone(&settings),
        registry: Arc::clone(&registry),
        metrics,
        encryptor,
        login: Mutex::new(LoginGuard::default()),
        sort_file: cli.sort_file,
    });

    // ── Background services ──
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();

    background.push(tokio::spawn(Arc::clone(&pipeline).run(shutdown_rx.clone())));

    if config.is_master {
        let cleaner = Arc::new(LogCleaner::new(logs, config.log_retention_days));
        background.push(tokio::spawn(cleaner.run(shutdown_rx.clone())));

        let validator = Arc::new(CronValidator::new(
            Arc::clone(&pool),
            keys,
            Arc::clone(&cache),
            registry,
            Arc::clone(&settings),
            client,
        ));
        background.push(tokio::spawn(validator.run(shutdown_rx.clone())));
        info!("Master services started (cleanup, validator)");
    }

    // ── Listeners ──
    let app = admin_router(admin_state).merge(routes::proxy_router(Arc::clone(&proxy_state)));
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Main listener bound (admin + proxy)");

    if let Some(proxy_port) = config.proxy_port {
        let stripped = routes::proxy_router(proxy_state);
        let proxy_addr = format!("{}:{proxy_port}", config.host);
        let proxy_listener = tokio::net::TcpListener::bind(&proxy_addr).await?;
        info!(addr = %proxy_addr, "Proxy-only listener bound");
        let mut rx = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.changed().await;
            };
            if let Err(e) = axum::serve(proxy_listener, stripped)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "Proxy-only listener failed");
            }
        }));
    }

    info!("loadgate is ready — serving traffic");

    // ── Serve until SIGTERM/SIGINT, then drain ──
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(
            shutdown_tx,
            Duration::from_secs(config.graceful_shutdown_timeout),
        ))
        .await?;

    // background services have a reserved 5s of the budget
    let drain = async {
        for handle in background {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        warn!("Background services did not drain in time");
    }
    cache.stop();

    info!("loadgate stopped");
    Ok(())
}

/// Resolves when SIGTERM or SIGINT arrives. Flips the shutdown flag
/// for background services and arms the force-exit timer so a hung
/// connection cannot keep the process alive past the budget.
async fn shutdown_signal(notify: watch::Sender<bool>, budget: Duration) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received, draining");
    let _ = notify.send(true);
    tokio::spawn(async move {
        tokio::time::sleep(budget).await;
        warn!("Graceful budget exhausted, forcing exit");
        std::process::exit(0);
    });
}
