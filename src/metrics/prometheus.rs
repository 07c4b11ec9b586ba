//! Concrete `MetricsSink` backed by the `prometheus` crate, in the same
//! style as the teacher's `ingest/metrics.rs` and `redis/metrics.rs`: typed
//! fields registered once against a private `Registry`, with `encode_text`
//! for the ambient HTTP endpoint to expose.

use super::{BackendLabel, MetricsSink};
use crate::error::TqdbResult;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

const BATCH_SIZE_BUCKETS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0,
];

#[derive(Clone)]
pub struct PrometheusMetricsSink {
    registry: Registry,

    total_queries: IntCounterVec,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    backend_queries: IntCounterVec,
    query_latency_seconds: HistogramVec,
    batched_writes: IntCounterVec,
    batch_size: HistogramVec,
    batch_wait_seconds: HistogramVec,
    batch_execute_seconds: HistogramVec,
}

impl PrometheusMetricsSink {
    pub fn new() -> TqdbResult<Self> {
        let registry = Registry::new();

        let total_queries = IntCounterVec::new(
            Opts::new("tqdb_queries_total", "Total queries seen by the proxy"),
            &["cached"],
        )?;

        let cache_hits = IntCounter::with_opts(Opts::new(
            "tqdb_cache_hits_total",
            "Cache hits (fresh, stale, or refresh-token reads)",
        ))?;

        let cache_misses = IntCounter::with_opts(Opts::new(
            "tqdb_cache_misses_total",
            "Cache misses (cold or hard-expired)",
        ))?;

        let backend_queries = IntCounterVec::new(
            Opts::new("tqdb_backend_queries_total", "Queries forwarded to a backend"),
            &["replica"],
        )?;

        let query_latency_seconds = HistogramVec::new(
            HistogramOpts::new("tqdb_query_latency_seconds", "Per-call-site query latency"),
            &["file", "line", "query_type"],
        )?;

        let batched_writes = IntCounterVec::new(
            Opts::new("tqdb_batched_writes_total", "Writes dispatched through the batch engine"),
            &["query_type"],
        )?;

        let batch_size = HistogramVec::new(
            HistogramOpts::new("tqdb_batch_size", "Number of statements per executed batch")
                .buckets(BATCH_SIZE_BUCKETS.to_vec()),
            &["truncated_query", "query_type"],
        )?;

        let batch_wait_seconds = HistogramVec::new(
            HistogramOpts::new(
                "tqdb_batch_wait_seconds",
                "Time a request waited in its batch group before dispatch",
            ),
            &["truncated_query", "query_type"],
        )?;

        let batch_execute_seconds = HistogramVec::new(
            HistogramOpts::new(
                "tqdb_batch_execute_seconds",
                "Time spent executing a dispatched batch against the backend",
            ),
            &["truncated_query", "query_type"],
        )?;

        registry.register(Box::new(total_queries.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(backend_queries.clone()))?;
        registry.register(Box::new(query_latency_seconds.clone()))?;
        registry.register(Box::new(batched_writes.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(batch_wait_seconds.clone()))?;
        registry.register(Box::new(batch_execute_seconds.clone()))?;

        Ok(Self {
            registry,
            total_queries,
            cache_hits,
            cache_misses,
            backend_queries,
            query_latency_seconds,
            batched_writes,
            batch_size,
            batch_wait_seconds,
            batch_execute_seconds,
        })
    }

    /// Render the registry in Prometheus text exposition format. Serving
    /// this over HTTP is ambient wiring done in `main.rs`, grounded on
    /// `prometheus/server.rs`.
    pub fn encode_text(&self) -> TqdbResult<String> {
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&mf, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

}

impl MetricsSink for PrometheusMetricsSink {
    fn inc_total_queries(&self, cached: bool) {
        self.total_queries
            .with_label_values(&[if cached { "true" } else { "false" }])
            .inc();
    }

    fn inc_cache_hit(&self) {
        self.cache_hits.inc();
    }

    fn inc_cache_miss(&self) {
        self.cache_misses.inc();
    }

    fn inc_backend_query(&self, label: &BackendLabel) {
        self.backend_queries
            .with_label_values(&[&label.as_label()])
            .inc();
    }

    fn observe_query_latency(&self, file: &str, line: u32, query_type: &str, seconds: f64) {
        self.query_latency_seconds
            .with_label_values(&[file, &line.to_string(), query_type])
            .observe(seconds);
    }

    fn inc_batched_write(&self, query_type: &str) {
        self.batched_writes.with_label_values(&[query_type]).inc();
    }

    fn observe_batch_size(&self, truncated_query: &str, query_type: &str, size: f64) {
        self.batch_size
            .with_label_values(&[truncated_query, query_type])
            .observe(size);
    }

    fn observe_batch_wait(&self, truncated_query: &str, query_type: &str, seconds: f64) {
        self.batch_wait_seconds
            .with_label_values(&[truncated_query, query_type])
            .observe(seconds);
    }

    fn observe_batch_execute(&self, truncated_query: &str, query_type: &str, seconds: f64) {
        self.batch_execute_seconds
            .with_label_values(&[truncated_query, query_type])
            .observe(seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        let sink = PrometheusMetricsSink::new().unwrap();
        sink.inc_total_queries(true);
        sink.inc_cache_hit();
        sink.inc_backend_query(&BackendLabel::Replica(1));
        sink.observe_batch_size("SELECT 1", "SELECT", 5.0);

        let text = sink.encode_text().unwrap();
        assert!(text.contains("tqdb_queries_total"));
        assert!(text.contains("tqdb_cache_hits_total"));
        assert!(text.contains("tqdb_batch_size"));
    }
}
