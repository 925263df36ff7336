use crate::metrics::Metrics;
use loadgate_core::log::RequestLog;
use loadgate_core::stats::{hour_bucket, month_bucket};
use loadgate_store::logs::LogRepo;
use loadgate_store::stats::StatsRepo;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Bounded drop-oldest queue between the request path and the batch
/// consumer. Producers never block and never touch the DB; when the
/// queue is full the oldest record is discarded and counted.
struct LogQueue {
    buffer: Mutex<VecDeque<RequestLog>>,
    capacity: usize,
}

impl LogQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Returns true when an old record was evicted to make room.
    fn push(&self, log: RequestLog) -> bool {
        let mut buffer = self.buffer.lock().expect("log queue poisoned");
        let dropped = if buffer.len() >= self.capacity {
            buffer.pop_front();
            true
        } else {
            false
        };
        buffer.push_back(log);
        dropped
    }

    fn drain(&self, max: usize) -> Vec<RequestLog> {
        let mut buffer = self.buffer.lock().expect("log queue poisoned");
        let take = max.min(buffer.len());
        buffer.drain(..take).collect()
    }

    fn len(&self) -> usize {
        self.buffer.lock().expect("log queue poisoned").len()
    }
}

/// Cheap clonable producer handle held by the proxy engine.
#[derive(Clone)]
pub struct LogSender {
    queue: Arc<LogQueue>,
    metrics: Arc<Metrics>,
}

impl LogSender {
    pub fn send(&self, log: RequestLog) {
        if self.queue.push(log) {
            self.metrics.dropped_logs_total.inc();
        }
    }
}

/// Batch consumer: drains the queue every flush interval, persists
/// one multi-row insert, then rolls the batch up into the hourly and
/// monthly stat rows with atomic upserts. Runs on the master only.
pub struct LogPipeline {
    queue: Arc<LogQueue>,
    metrics: Arc<Metrics>,
    logs: LogRepo,
    stats: StatsRepo,
    batch_size: usize,
    flush_interval: Duration,
}

impl LogPipeline {
    pub fn new(
        logs: LogRepo,
        stats: StatsRepo,
        metrics: Arc<Metrics>,
        queue_capacity: usize,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            queue: Arc::new(LogQueue::new(queue_capacity)),
            metrics,
            logs,
            stats,
            batch_size,
            flush_interval,
        }
    }

    pub fn sender(&self) -> LogSender {
        LogSender {
            queue: Arc::clone(&self.queue),
            metrics: Arc::clone(&self.metrics),
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Consume until shutdown, then drain whatever is left.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
                _ = shutdown.changed() => {
                    self.flush_once().await;
                    debug!("Log pipeline drained and stopped");
                    return;
                }
            }
        }
    }

    /// Drain the queue in batch-sized chunks. A failed insert keeps
    /// the batch dropped (logged) rather than blocking the queue; the
    /// next tick continues with fresh records.
    pub async fn flush_once(&self) {
        loop {
            let batch = self.queue.drain(self.batch_size);
            if batch.is_empty() {
                return;
            }
            let len = batch.len();
            if let Err(e) = self.logs.insert_batch(&batch).await {
                warn!(error = %e, batch = len, "Log batch insert failed");
            } else {
                self.roll_up(&batch).await;
                debug!(batch = len, "Log batch persisted");
            }
            if len < self.batch_size {
                return;
            }
        }
    }

    /// Aggregate the batch per (group, bucket) and upsert the deltas.
    async fn roll_up(&self, batch: &[RequestLog]) {
        // (success, failure) per group-hour
        let mut hourly: HashMap<(i64, chrono::DateTime<chrono::Utc>), (i64, i64)> = HashMap::new();
        let mut monthly: HashMap<(i64, chrono::DateTime<chrono::Utc>), (i64, i64, i64)> =
            HashMap::new();
        for log in batch {
            let ok = log.is_success();
            let hour = hourly.entry((log.group_id, hour_bucket(log.timestamp))).or_default();
            if ok {
                hour.0 += 1;
            } else {
                hour.1 += 1;
            }
            let month = monthly
                .entry((log.group_id, month_bucket(log.timestamp)))
                .or_default();
            month.0 += 1;
            if ok {
                month.1 += 1;
            } else {
                month.2 += 1;
            }
        }

        for ((group_id, bucket), (success, failure)) in hourly {
            if let Err(e) = self.stats.bump_hourly(group_id, bucket, success, failure).await {
                warn!(error = %e, group_id, "Hourly stat upsert failed");
            }
        }
        for ((group_id, bucket), (requests, success, failure)) in monthly {
            if let Err(e) = self
                .stats
                .bump_monthly(group_id, bucket, requests, success, failure)
                .await
            {
                warn!(error = %e, group_id, "Monthly stat upsert failed");
            }
        }
    }
}
