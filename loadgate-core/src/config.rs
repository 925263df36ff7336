use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::{Deserialize, Serialize};

/// Process-wide configuration, read from the environment.
///
/// Every field maps 1:1 to an environment variable (`AUTH_KEY`,
/// `PORT`, `LOG_BATCH_SIZE`, ...). DB-backed system settings can
/// override the per-group tunables at runtime; this struct only
/// holds what must be known before the store is up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Admin session key. Required. Compared in constant time.
    #[serde(default)]
    pub auth_key: String,

    /// Source of the data-at-rest key, stretched with PBKDF2-SHA256.
    #[serde(default)]
    pub encryption_key: String,

    /// Listener bind host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Admin + proxy listener port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional second listener serving proxy-only routes.
    #[serde(default)]
    pub proxy_port: Option<u16>,

    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,

    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Seconds to wait for in-flight requests on shutdown.
    /// Background services get a reserved 5s slice of this budget.
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout: u64,

    /// Master nodes run migrations, the pool cold load, log
    /// persistence, cleanup, and the cron validator.
    #[serde(default = "default_true")]
    pub is_master: bool,

    /// Semaphore cap on concurrently dispatched proxy requests.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_max_failed_logins")]
    pub max_failed_login_attempts: u32,

    #[serde(default = "default_lockout_duration")]
    pub lockout_duration_seconds: u64,

    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,

    #[serde(default = "default_log_batch_size")]
    pub log_batch_size: usize,

    #[serde(default = "default_log_flush_interval_ms")]
    pub log_flush_interval_ms: u64,

    #[serde(default = "default_log_queue_capacity")]
    pub log_queue_capacity: usize,

    /// CORS allowlist, comma-separated. `*` only outside production.
    #[serde(default)]
    pub allowed_origins: String,

    /// SQLite DSN, e.g. `sqlite://data/loadgate.db`.
    #[serde(default = "default_db_dsn")]
    pub db_dsn: String,

    /// Optional external KV address. Unset selects the in-memory store.
    #[serde(default)]
    pub kv_addr: Option<String>,
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn load() -> anyhow::Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Env::raw())
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation — required secrets and numeric sanity.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth_key.is_empty() {
            anyhow::bail!("AUTH_KEY must be set");
        }
        if self.encryption_key.is_empty() {
            anyhow::bail!("ENCRYPTION_KEY must be set");
        }
        if let Some(p) = self.proxy_port {
            if p == 0 {
                anyhow::bail!("PROXY_PORT must be > 0 when set");
            }
            if p == self.port {
                anyhow::bail!("PROXY_PORT must differ from PORT");
            }
        }
        if self.log_queue_capacity == 0 {
            anyhow::bail!("LOG_QUEUE_CAPACITY must be > 0");
        }
        if self.log_batch_size == 0 {
            anyhow::bail!("LOG_BATCH_SIZE must be > 0");
        }
        Ok(())
    }

    /// Parsed CORS origins. A lone `*` means allow-any.
    pub fn cors_origins(&self) -> Vec<String> {
        self.allowed_origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            auth_key: String::new(),
            encryption_key: String::new(),
            host: default_host(),
            port: default_port(),
            proxy_port: None,
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            idle_timeout: default_idle_timeout(),
            graceful_shutdown_timeout: default_graceful_shutdown_timeout(),
            is_master: true,
            max_concurrent_requests: default_max_concurrent(),
            max_failed_login_attempts: default_max_failed_logins(),
            lockout_duration_seconds: default_lockout_duration(),
            log_retention_days: default_log_retention_days(),
            log_batch_size: default_log_batch_size(),
            log_flush_interval_ms: default_log_flush_interval_ms(),
            log_queue_capacity: default_log_queue_capacity(),
            allowed_origins: String::new(),
            db_dsn: default_db_dsn(),
            kv_addr: None,
        }
    }
}

// Serde default functions

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_read_timeout() -> u64 {
    60
}

fn default_write_timeout() -> u64 {
    600
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_graceful_shutdown_timeout() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    1024
}

fn default_max_failed_logins() -> u32 {
    5
}

fn default_lockout_duration() -> u64 {
    900
}

fn default_log_retention_days() -> u32 {
    30
}

fn default_log_batch_size() -> usize {
    200
}

fn default_log_flush_interval_ms() -> u64 {
    1000
}

fn default_log_queue_capacity() -> usize {
    10_000
}

fn default_db_dsn() -> String {
    "sqlite://data/loadgate.db?mode=rwc".to_string()
}

fn default_true() -> bool {
    true
}
