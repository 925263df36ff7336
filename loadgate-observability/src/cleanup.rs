use loadgate_store::logs::LogRepo;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const PRUNE_CHUNK: i64 = 500;
const CYCLE: Duration = Duration::from_secs(24 * 60 * 60);

/// Daily retention pruning of `request_logs`, chunked so the writer
/// never holds a long lock. Master-only.
pub struct LogCleaner {
    logs: LogRepo,
    retention_days: u32,
}

impl LogCleaner {
    pub fn new(logs: LogRepo, retention_days: u32) -> Self {
        Self {
            logs,
            retention_days,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        // first sweep shortly after boot, then daily
        let mut ticker = tokio::time::interval(CYCLE);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                _ = shutdown.changed() => {
                    return;
                }
            }
        }
    }

    pub async fn sweep_once(&self) {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(self.retention_days as i64);
        match self.logs.prune_before(cutoff, PRUNE_CHUNK).await {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, retention_days = self.retention_days, "Old logs pruned"),
            Err(e) => warn!(error = %e, "Log pruning failed; retrying next cycle"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadgate_core::log::RequestLog;
    use loadgate_store::db::connect_ephemeral;

    fn aged_log(id: &str, age_days: i64) -> RequestLog {
        RequestLog {
            id: id.into(),
            timestamp: chrono::Utc::now() - chrono::Duration::days(age_days),
            group_id: 1,
            group_name: "g1".into(),
            upstream_url: "https://api.openai.com".into(),
            key_hash: "h".into(),
            key_value: "enc".into(),
            model: "gpt-4o".into(),
            status_code: 200,
            duration_ms: 3,
            is_stream: false,
            retries: 0,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_sweep_respects_retention_window() {
        let pool = connect_ephemeral().await.unwrap();
        let logs = LogRepo::new(pool);
        logs.insert_batch(&[aged_log("ancient", 45), aged_log("recent", 3)])
            .await
            .unwrap();

        LogCleaner::new(logs.clone(), 30).sweep_once().await;

        let (rows, total) = logs.query(&Default::default()).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, "recent");
    }
}
