use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Prometheus metrics, scraped from the admin listener's `/metrics`.
pub struct Metrics {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub retries_total: IntCounter,
    pub dropped_logs_total: IntCounter,
    pub rate_limited_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("loadgate_requests_total", "Proxied requests by group and status class"),
            &["group", "class"],
        )
        .expect("static metric definition");
        let retries_total = IntCounter::new(
            "loadgate_retries_total",
            "Upstream attempts beyond the first, across all groups",
        )
        .expect("static metric definition");
        let dropped_logs_total = IntCounter::new(
            "loadgate_dropped_logs_total",
            "Request logs dropped because the pipeline queue was full",
        )
        .expect("static metric definition");
        let rate_limited_total = IntCounterVec::new(
            Opts::new("loadgate_rate_limited_total", "Requests denied by the rate limiter"),
            &["group", "reason"],
        )
        .expect("static metric definition");

        registry.register(Box::new(requests_total.clone())).ok();
        registry.register(Box::new(retries_total.clone())).ok();
        registry.register(Box::new(dropped_logs_total.clone())).ok();
        registry.register(Box::new(rate_limited_total.clone())).ok();

        Self {
            registry,
            requests_total,
            retries_total,
            dropped_logs_total,
            rate_limited_total,
        }
    }

    pub fn observe_request(&self, group: &str, status: u16) {
        let class = match status {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            _ => "5xx",
        };
        self.requests_total.with_label_values(&[group, class]).inc();
    }

    /// Prometheus text exposition.
    pub fn gather_text(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_request_classes() {
        let metrics = Metrics::new();
        metrics.observe_request("g1", 200);
        metrics.observe_request("g1", 204);
        metrics.observe_request("g1", 429);
        metrics.observe_request("g2", 502);

        let text = metrics.gather_text();
        assert!(text.contains(r#"loadgate_requests_total{class="2xx",group="g1"} 2"#));
        assert!(text.contains(r#"loadgate_requests_total{class="4xx",group="g1"} 1"#));
        assert!(text.contains(r#"loadgate_requests_total{class="5xx",group="g2"} 1"#));
    }

    #[test]
    fn test_dropped_logs_counter() {
        let metrics = Metrics::new();
        metrics.dropped_logs_total.inc();
        metrics.dropped_logs_total.inc();
        assert!(metrics.gather_text().contains("loadgate_dropped_logs_total 2"));
    }
}
