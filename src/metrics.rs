//! Ambient request/outcome metrics, adapted from the teacher's
//! `prometheus::Registry` wrapper with this domain's outcome labels
//! (`hit | miss | redirect`) in place of the teacher's generic HTTP-cache
//! cache-status set.

use std::time::Duration;

use prometheus::{Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    requests_total: CounterVec,
    request_duration: HistogramVec,
    bytes_served: CounterVec,
    chunked_uncacheable: CounterVec,
    // Label-free rollups kept alongside the per-host series so `/stats` can
    // report a cheap aggregate without re-summing the registry's families.
    requests_total_sum: Counter,
    cache_hits_sum: Counter,
    bytes_served_sum: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new(
                "mediacache_requests_total",
                "Total requests by origin and outcome",
            ),
            &["host", "outcome"],
        )
        .unwrap();

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "mediacache_request_duration_seconds",
                "Request duration in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["host", "outcome"],
        )
        .unwrap();

        let bytes_served = CounterVec::new(
            Opts::new("mediacache_bytes_served_total", "Total bytes served"),
            &["host", "outcome"],
        )
        .unwrap();

        let chunked_uncacheable = CounterVec::new(
            Opts::new(
                "mediacache_chunked_uncacheable_total",
                "Origin responses streamed without caching because Content-Length was absent",
            ),
            &["host"],
        )
        .unwrap();

        let requests_total_sum =
            Counter::new("mediacache_requests_total_sum", "Total requests, all hosts").unwrap();
        let cache_hits_sum =
            Counter::new("mediacache_cache_hits_total_sum", "Total cache hits, all hosts").unwrap();
        let bytes_served_sum = Counter::new(
            "mediacache_bytes_served_total_sum",
            "Total bytes served, all hosts",
        )
        .unwrap();

        registry.register(Box::new(requests_total.clone())).unwrap();
        registry
            .register(Box::new(request_duration.clone()))
            .unwrap();
        registry.register(Box::new(bytes_served.clone())).unwrap();
        registry
            .register(Box::new(chunked_uncacheable.clone()))
            .unwrap();
        registry
            .register(Box::new(requests_total_sum.clone()))
            .unwrap();
        registry.register(Box::new(cache_hits_sum.clone())).unwrap();
        registry
            .register(Box::new(bytes_served_sum.clone()))
            .unwrap();

        Self {
            registry,
            requests_total,
            request_duration,
            bytes_served,
            chunked_uncacheable,
            requests_total_sum,
            cache_hits_sum,
            bytes_served_sum,
        }
    }

    pub fn record_request(&self, host: &str, outcome: &str, duration: Duration) {
        self.requests_total.with_label_values(&[host, outcome]).inc();
        self.request_duration
            .with_label_values(&[host, outcome])
            .observe(duration.as_secs_f64());
        self.requests_total_sum.inc();
        if outcome == "hit" {
            self.cache_hits_sum.inc();
        }
    }

    pub fn record_bytes_served(&self, host: &str, outcome: &str, bytes: u64) {
        self.bytes_served
            .with_label_values(&[host, outcome])
            .inc_by(bytes as f64);
        self.bytes_served_sum.inc_by(bytes as f64);
    }

    pub fn record_chunked_uncacheable(&self, host: &str) {
        self.chunked_uncacheable.with_label_values(&[host]).inc();
    }

    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Small non-sensitive rollup for `GET /stats`, sourced from the same
    /// counters `/metrics` reads from rather than from any user-supplied
    /// state.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests_total = self.requests_total_sum.get();
        let cache_hits = self.cache_hits_sum.get();
        let cache_hit_ratio = if requests_total > 0.0 {
            cache_hits / requests_total
        } else {
            0.0
        };
        MetricsSnapshot {
            requests_total: requests_total as u64,
            cache_hit_ratio,
            bytes_served: self.bytes_served_sum.get() as u64,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub cache_hit_ratio: f64,
    pub bytes_served: u64,
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
    fn records_and_gathers_without_panicking() {
        let metrics = Metrics::new();
        metrics.record_request("example.com", "hit", Duration::from_millis(5));
        metrics.record_bytes_served("example.com", "hit", 1024);
        metrics.record_chunked_uncacheable("example.com");
        let text = metrics.gather();
        assert!(text.contains("mediacache_requests_total"));
        assert!(text.contains("mediacache_chunked_uncacheable_total"));
    }

    #[test]
    fn snapshot_reflects_recorded_hits() {
        let metrics = Metrics::new();
        metrics.record_request("example.com", "hit", Duration::from_millis(1));
        metrics.record_request("example.com", "miss", Duration::from_millis(1));
        metrics.record_bytes_served("example.com", "hit", 500);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.cache_hit_ratio, 0.5);
        assert_eq!(snapshot.bytes_served, 500);
    }
}
