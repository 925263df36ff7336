use loadgate_core::GatewayError;
use loadgate_core::group::Group;
use loadgate_core::stats::{hour_bucket, month_bucket, next_hour, next_month};
use loadgate_store::settings::Settings;
use loadgate_store::stats::StatsRepo;
use std::sync::Arc;

/// Quota verdict. Denials carry enough to build the 429 response.
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allow,
    Deny {
        reason: &'static str,
        reset_at: chrono::DateTime<chrono::Utc>,
        limit: u64,
        used: u64,
    },
}

/// Per-group quota checks against the roll-up rows. Counters are
/// written by the log pipeline, so an in-flight batch can overshoot
/// a limit by at most one batch per group — accepted.
pub struct RateLimiter {
    stats: StatsRepo,
    settings: Arc<Settings>,
}

impl RateLimiter {
    pub fn new(stats: StatsRepo, settings: Arc<Settings>) -> Self {
        Self { stats, settings }
    }

    pub async fn check(&self, group: &Group) -> Result<RateDecision, GatewayError> {
        let now = chrono::Utc::now();
        let effective = group.config.effective(&self.settings.snapshot());

        if let Some(expires_at) = effective.expires_at {
            if expires_at <= now {
                return Ok(RateDecision::Deny {
                    reason: "expired",
                    reset_at: expires_at,
                    limit: 0,
                    used: 0,
                });
            }
        }

        if effective.max_requests_per_hour > 0 {
            let used = self
                .stats
                .hourly(group.id, hour_bucket(now))
                .await?
                .map(|s| (s.success_count + s.failure_count) as u64)
                .unwrap_or(0);
            if used >= effective.max_requests_per_hour {
                return Ok(RateDecision::Deny {
                    reason: "hourly_limit",
                    reset_at: next_hour(now),
                    limit: effective.max_requests_per_hour,
                    used,
                });
            }
        }

        if effective.max_requests_per_month > 0 {
            let used = self
                .stats
                .monthly(group.id, month_bucket(now))
                .await?
                .map(|s| s.request_count as u64)
                .unwrap_or(0);
            if used >= effective.max_requests_per_month {
                return Ok(RateDecision::Deny {
                    reason: "monthly_limit",
                    reset_at: next_month(now),
                    limit: effective.max_requests_per_month,
                    used,
                });
            }
        }

        Ok(RateDecision::Allow)
    }
}
