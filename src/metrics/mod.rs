//! Metrics Sink Adapter (spec.md §4.G).
//!
//! The core only depends on an abstract `MetricsSink` trait — a typed
//! facade over counters/histograms/gauges, mirroring the teacher's
//! `IngestMetrics`/`DbMetrics`/`RedisMetrics` structs but expressed as an
//! interface so the wire-protocol front ends, cache engine, and batch
//! engine can all be tested against a no-op or in-memory sink without
//! pulling in a concrete metrics backend. `metrics::prometheus` supplies the
//! concrete adapter used in production.

pub mod prometheus;

/// Which replica slot served a backend query, for the `replica` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendLabel {
    Primary,
    Replica(usize),
}

impl BackendLabel {
    pub fn as_label(&self) -> String {
        match self {
            BackendLabel::Primary => "primary".to_string(),
            BackendLabel::Replica(i) => format!("replicas[{i}]"),
        }
    }
}

pub trait MetricsSink: Send + Sync {
    /// Total queries seen, labeled by whether the response came from cache.
    fn inc_total_queries(&self, cached: bool);

    fn inc_cache_hit(&self);
    fn inc_cache_miss(&self);

    fn inc_backend_query(&self, label: &BackendLabel);

    /// Per-call-site query latency, labeled by `(file, line, query_type)`
    /// where available.
    fn observe_query_latency(&self, file: &str, line: u32, query_type: &str, seconds: f64);

    fn inc_batched_write(&self, query_type: &str);

    /// `truncated_query` must already be truncated to <=50 chars by the
    /// caller (spec.md §4.C).
    fn observe_batch_size(&self, truncated_query: &str, query_type: &str, size: f64);
    fn observe_batch_wait(&self, truncated_query: &str, query_type: &str, seconds: f64);
    fn observe_batch_execute(&self, truncated_query: &str, query_type: &str, seconds: f64);

    fn set_write_throughput(&self, _rows_per_sec: f64) {}
    fn set_batching_window(&self, _ms: f64) {}
}

/// Truncate a query to at most 50 chars for use as a batch metric label,
/// as specified in spec.md §4.C.
pub fn truncate_for_label(query: &str) -> &str {
    match query.char_indices().nth(50) {
        Some((idx, _)) => &query[..idx],
        None => query,
    }
}

/// A sink that discards everything; useful for tests and for running with
/// metrics disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn inc_total_queries(&self, _cached: bool) {}
    fn inc_cache_hit(&self) {}
    fn inc_cache_miss(&self) {}
    fn inc_backend_query(&self, _label: &BackendLabel) {}
    fn observe_query_latency(&self, _file: &str, _line: u32, _query_type: &str, _seconds: f64) {}
    fn inc_batched_write(&self, _query_type: &str) {}
    fn observe_batch_size(&self, _truncated_query: &str, _query_type: &str, _size: f64) {}
    fn observe_batch_wait(&self, _truncated_query: &str, _query_type: &str, _seconds: f64) {}
    fn observe_batch_execute(&self, _truncated_query: &str, _query_type: &str, _seconds: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_passes_short_strings_through() {
        assert_eq!(truncate_for_label("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn truncate_caps_at_50_chars() {
        let long = "x".repeat(200);
        assert_eq!(truncate_for_label(&long).len(), 50);
    }

    #[test]
    fn backend_label_formatting() {
        assert_eq!(BackendLabel::Primary.as_label(), "primary");
        assert_eq!(BackendLabel::Replica(2).as_label(), "replicas[2]");
    }
}
