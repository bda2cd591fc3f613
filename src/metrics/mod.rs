//! In-process metrics for the trace analyzer
//!
//! Counters and latency histograms, exported as JSON into the service log.
//! Names are dotted (`analyzer.traces.analyzed`).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Metrics registry shared by all workers
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
    histograms: RwLock<BTreeMap<String, Arc<Histogram>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            histograms: RwLock::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Increment a counter
    pub async fn inc_counter(&self, name: &str) {
        self.add_counter(name, 1).await;
    }

    /// Add to a counter
    pub async fn add_counter(&self, name: &str, value: u64) {
        let counters = self.counters.read().await;
        if let Some(counter) = counters.get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        drop(counters);

        let mut counters = self.counters.write().await;
        let counter = counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub async fn get_counter(&self, name: &str) -> u64 {
        let counters = self.counters.read().await;
        counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a histogram observation
    pub async fn observe_histogram(&self, name: &str, value: f64) {
        let histograms = self.histograms.read().await;
        if let Some(histogram) = histograms.get(name) {
            histogram.observe(value);
            return;
        }
        drop(histograms);

        let mut histograms = self.histograms.write().await;
        histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::default()))
            .observe(value);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// All metrics as JSON
    pub async fn to_json(&self) -> serde_json::Value {
        let counters = self.counters.read().await;
        let histograms = self.histograms.read().await;

        let counter_values: BTreeMap<&str, u64> = counters
            .iter()
            .map(|(k, v)| (k.as_str(), v.load(Ordering::Relaxed)))
            .collect();
        let histogram_values: BTreeMap<&str, serde_json::Value> = histograms
            .iter()
            .map(|(k, h)| (k.as_str(), h.to_json()))
            .collect();

        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "counters": counter_values,
            "histograms": histogram_values,
        })
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-bucket histogram
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    /// Sum of observations in microseconds
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let micros = (value.max(0.0) * 1_000_000.0) as u64;
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        if let Some(i) = self.buckets.iter().position(|bucket| value <= *bucket) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn to_json(&self) -> serde_json::Value {
        let bucket_counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();

        serde_json::json!({
            "buckets": self.buckets,
            "counts": bucket_counts,
            "sum": self.sum(),
            "count": self.count(),
        })
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // latency in seconds
        Self::new(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ])
    }
}

/// Predefined metric names
pub mod metric_names {
    // Trace outcomes
    pub const TRACES_PROCESSED: &str = "analyzer.traces.processed";
    pub const TRACES_ANALYZED: &str = "analyzer.traces.analyzed";
    pub const TRACES_SKIPPED: &str = "analyzer.traces.skipped";
    pub const TRACES_FAILED: &str = "analyzer.traces.failed";

    // Alerts
    pub const ALERTS_RAISED: &str = "analyzer.alerts.raised";

    // Commits
    pub const COMMIT_RETRIES: &str = "analyzer.commit.retries";

    // Latency
    pub const ANALYZE_LATENCY: &str = "analyzer.analyze.latency_seconds";

    // Queue
    pub const QUEUE_EMPTY_POLLS: &str = "analyzer.queue.empty_polls";
    pub const QUEUE_ERRORS: &str = "analyzer.queue.errors";
}

/// Time an async operation into a histogram
pub async fn timed<F, T>(metrics: &MetricsRegistry, metric_name: &str, f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let result = f.await;
    metrics
        .observe_histogram(metric_name, start.elapsed().as_secs_f64())
        .await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counter() {
        let registry = MetricsRegistry::new();

        registry.inc_counter(metric_names::TRACES_ANALYZED).await;
        registry.inc_counter(metric_names::TRACES_ANALYZED).await;
        registry.add_counter(metric_names::TRACES_ANALYZED, 5).await;

        assert_eq!(registry.get_counter(metric_names::TRACES_ANALYZED).await, 7);
        assert_eq!(registry.get_counter("missing").await, 0);
    }

    #[tokio::test]
    async fn test_timed_records_latency() {
        let registry = MetricsRegistry::new();

        let value = timed(&registry, metric_names::ANALYZE_LATENCY, async { 42 }).await;
        assert_eq!(value, 42);

        let json = registry.to_json().await;
        let latency = &json["histograms"][metric_names::ANALYZE_LATENCY];
        assert_eq!(latency["count"].as_u64(), Some(1));
    }

    #[test]
    fn test_histogram_buckets() {
        let histogram = Histogram::new(vec![0.1, 1.0]);
        histogram.observe(0.05);
        histogram.observe(0.5);
        histogram.observe(5.0);

        let json = histogram.to_json();
        assert_eq!(json["counts"], serde_json::json!([1, 1]));
        assert_eq!(json["count"].as_u64(), Some(3));
    }

    #[tokio::test]
    async fn test_json_export() {
        let registry = MetricsRegistry::new();

        registry.inc_counter(metric_names::ALERTS_RAISED).await;
        registry.add_counter(metric_names::COMMIT_RETRIES, 3).await;

        let json = registry.to_json().await;
        assert_eq!(json["counters"][metric_names::ALERTS_RAISED].as_u64(), Some(1));
        assert_eq!(json["counters"][metric_names::COMMIT_RETRIES].as_u64(), Some(3));
        assert!(json["histograms"].as_object().is_some_and(|h| h.is_empty()));
    }
}
