use serde::{Deserialize, Serialize};

/// Per-group overrides. Every field is optional; `None` means
/// "inherit the system default", which keeps zero values (e.g.
/// `max_retries = 0`) distinguishable from absence.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub max_retries: Option<u32>,
    pub upstream_timeout_seconds: Option<u64>,
    pub connect_timeout_seconds: Option<u64>,
    pub idle_conn_timeout_seconds: Option<u64>,
    pub response_header_timeout_seconds: Option<u64>,
    pub blacklist_threshold: Option<u32>,
    pub key_validation_interval_minutes: Option<u64>,
    pub key_validation_concurrency: Option<usize>,
    pub key_validation_timeout_seconds: Option<u64>,
    /// 0 disables the hourly quota.
    pub max_requests_per_hour: Option<u64>,
    /// 0 disables the monthly quota.
    pub max_requests_per_month: Option<u64>,
    /// Local time, `YYYY-MM-DD HH:MM:SS`.
    pub expires_at: Option<String>,
}

/// System-wide defaults, initialised from built-ins and overridable
/// through the `system_settings` table. Components re-read these via
/// an immutable snapshot rather than holding references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemSettings {
    pub max_retries: u32,
    pub upstream_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub idle_conn_timeout_seconds: u64,
    pub response_header_timeout_seconds: u64,
    pub blacklist_threshold: u32,
    pub key_validation_interval_minutes: u64,
    pub key_validation_concurrency: usize,
    pub key_validation_timeout_seconds: u64,
    pub max_requests_per_hour: u64,
    pub max_requests_per_month: u64,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            upstream_timeout_seconds: 600,
            connect_timeout_seconds: 15,
            idle_conn_timeout_seconds: 90,
            response_header_timeout_seconds: 60,
            blacklist_threshold: 3,
            key_validation_interval_minutes: 60,
            key_validation_concurrency: 10,
            key_validation_timeout_seconds: 20,
            max_requests_per_hour: 0,
            max_requests_per_month: 0,
        }
    }
}

/// Fully resolved configuration for one group: group override where
/// present, system default otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub max_retries: u32,
    pub upstream_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub idle_conn_timeout_seconds: u64,
    pub response_header_timeout_seconds: u64,
    pub blacklist_threshold: u32,
    pub key_validation_interval_minutes: u64,
    pub key_validation_concurrency: usize,
    pub key_validation_timeout_seconds: u64,
    pub max_requests_per_hour: u64,
    pub max_requests_per_month: u64,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl GroupConfig {
    pub fn validate(&self) -> Result<(), crate::GatewayError> {
        if self.upstream_timeout_seconds == Some(0) {
            return Err(crate::GatewayError::Validation(
                "upstream_timeout_seconds must be >= 1".into(),
            ));
        }
        if self.key_validation_timeout_seconds == Some(0) {
            return Err(crate::GatewayError::Validation(
                "key_validation_timeout_seconds must be >= 1".into(),
            ));
        }
        if self.key_validation_concurrency == Some(0) {
            return Err(crate::GatewayError::Validation(
                "key_validation_concurrency must be >= 1".into(),
            ));
        }
        if self.blacklist_threshold == Some(0) {
            return Err(crate::GatewayError::Validation(
                "blacklist_threshold must be >= 1".into(),
            ));
        }
        if let Some(raw) = &self.expires_at {
            Self::parse_expiry(raw)?;
        }
        Ok(())
    }

    /// Resolve against the system defaults.
    pub fn effective(&self, defaults: &SystemSettings) -> EffectiveConfig {
        EffectiveConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            upstream_timeout_seconds: self
                .upstream_timeout_seconds
                .unwrap_or(defaults.upstream_timeout_seconds),
            connect_timeout_seconds: self
                .connect_timeout_seconds
                .unwrap_or(defaults.connect_timeout_seconds),
            idle_conn_timeout_seconds: self
                .idle_conn_timeout_seconds
                .unwrap_or(defaults.idle_conn_timeout_seconds),
            response_header_timeout_seconds: self
                .response_header_timeout_seconds
                .unwrap_or(defaults.response_header_timeout_seconds),
            blacklist_threshold: self
                .blacklist_threshold
                .unwrap_or(defaults.blacklist_threshold),
            key_validation_interval_minutes: self
                .key_validation_interval_minutes
                .unwrap_or(defaults.key_validation_interval_minutes),
            key_validation_concurrency: self
                .key_validation_concurrency
                .unwrap_or(defaults.key_validation_concurrency),
            key_validation_timeout_seconds: self
                .key_validation_timeout_seconds
                .unwrap_or(defaults.key_validation_timeout_seconds),
            max_requests_per_hour: self
                .max_requests_per_hour
                .unwrap_or(defaults.max_requests_per_hour),
            max_requests_per_month: self
                .max_requests_per_month
                .unwrap_or(defaults.max_requests_per_month),
            expires_at: self
                .expires_at
                .as_deref()
                .and_then(|raw| Self::parse_expiry(raw).ok()),
        }
    }

    /// `YYYY-MM-DD HH:MM:SS` in the server's local timezone.
    fn parse_expiry(raw: &str) -> Result<chrono::DateTime<chrono::Utc>, crate::GatewayError> {
        use chrono::TimeZone;

        let naive = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .map_err(|e| crate::GatewayError::Validation(format!("invalid expires_at: {e}")))?;
        match chrono::Local.from_local_datetime(&naive) {
            chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
                Ok(dt.with_timezone(&chrono::Utc))
            }
            chrono::LocalResult::None => Err(crate::GatewayError::Validation(format!(
                "expires_at does not exist in local time: {raw}"
            ))),
        }
    }
}
