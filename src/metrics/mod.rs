//! In-process metrics for the distribution service
//!
//! Counters, gauges and latency histograms keyed by dotted names, exported
//! as JSON or Prometheus text on `/metrics`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Metrics registry shared by the distributor and the HTTP layer
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
    gauges: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
    histograms: RwLock<BTreeMap<String, Arc<Histogram>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            histograms: RwLock::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }

    pub async fn inc_counter(&self, name: &str) {
        self.add_counter(name, 1).await;
    }

    pub async fn add_counter(&self, name: &str, value: u64) {
        Self::slot(&self.counters, name)
            .await
            .fetch_add(value, Ordering::Relaxed);
    }

    pub async fn set_gauge(&self, name: &str, value: u64) {
        Self::slot(&self.gauges, name)
            .await
            .store(value, Ordering::Relaxed);
    }

    pub async fn get_counter(&self, name: &str) -> u64 {
        Self::read(&self.counters, name).await
    }

    pub async fn get_gauge(&self, name: &str) -> u64 {
        Self::read(&self.gauges, name).await
    }

    /// Record a latency observation in seconds
    pub async fn observe_histogram(&self, name: &str, seconds: f64) {
        let existing = self.histograms.read().await.get(name).cloned();
        let histogram = match existing {
            Some(h) => h,
            None => self
                .histograms
                .write()
                .await
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Histogram::default()))
                .clone(),
        };
        histogram.observe(seconds);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    async fn slot(map: &RwLock<BTreeMap<String, Arc<AtomicU64>>>, name: &str) -> Arc<AtomicU64> {
        if let Some(value) = map.read().await.get(name) {
            return value.clone();
        }
        map.write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    async fn read(map: &RwLock<BTreeMap<String, Arc<AtomicU64>>>, name: &str) -> u64 {
        map.read()
            .await
            .get(name)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub async fn to_json(&self) -> serde_json::Value {
        let load = |map: &BTreeMap<String, Arc<AtomicU64>>| -> BTreeMap<String, u64> {
            map.iter()
                .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
                .collect()
        };

        let counters = load(&*self.counters.read().await);
        let gauges = load(&*self.gauges.read().await);
        let histograms: BTreeMap<String, serde_json::Value> = self
            .histograms
            .read()
            .await
            .iter()
            .map(|(k, h)| (k.clone(), h.to_json()))
            .collect();

        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }

    /// Prometheus text exposition, names sorted
    pub async fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP distribution_uptime_seconds Time since service start\n");
        output.push_str("# TYPE distribution_uptime_seconds gauge\n");
        output.push_str(&format!(
            "distribution_uptime_seconds {}\n",
            self.uptime_seconds()
        ));

        for (kind, map) in [("counter", &self.counters), ("gauge", &self.gauges)] {
            for (name, value) in map.read().await.iter() {
                let name = prometheus_name(name);
                output.push_str(&format!("# TYPE {name} {kind}\n"));
                output.push_str(&format!("{name} {}\n", value.load(Ordering::Relaxed)));
            }
        }

        for (name, histogram) in self.histograms.read().await.iter() {
            output.push_str(&histogram.to_prometheus(&prometheus_name(name)));
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn prometheus_name(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

/// Fixed-bucket histogram
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    /// Sum in microseconds
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
        self.sum_micros
            .fetch_add((value.max(0.0) * 1_000_000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        if let Some(idx) = self.buckets.iter().position(|b| value <= *b) {
            self.counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn to_json(&self) -> serde_json::Value {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();

        serde_json::json!({
            "buckets": self.buckets,
            "counts": counts,
            "sum": self.sum(),
            "count": self.count(),
        })
    }

    fn to_prometheus(&self, name: &str) -> String {
        let mut output = format!("# TYPE {name} histogram\n");

        let mut cumulative = 0u64;
        for (bucket, count) in self.buckets.iter().zip(&self.counts) {
            cumulative += count.load(Ordering::Relaxed);
            output.push_str(&format!("{name}_bucket{{le=\"{bucket}\"}} {cumulative}\n"));
        }
        output.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", self.count()));
        output.push_str(&format!("{name}_sum {}\n", self.sum()));
        output.push_str(&format!("{name}_count {}\n", self.count()));
        output
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // Seconds; ledger operations are expected in the low milliseconds
        Self::new(vec![
            0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
        ])
    }
}

/// Metric names
pub mod metric_names {
    pub const EVENTS_APPENDED: &str = "distribution.events.appended";
    pub const EVENTS_DUPLICATE: &str = "distribution.events.duplicate";
    pub const EVENTS_APPLIED: &str = "distribution.events.applied";
    pub const EVENTS_REPLAYED: &str = "distribution.events.replayed";

    pub const DISTRIBUTIONS_APPLIED: &str = "distribution.manual.applied";
    pub const DISTRIBUTIONS_REPLAYED: &str = "distribution.manual.replayed";

    pub const INSUFFICIENT_FUNDS: &str = "distribution.errors.insufficient_funds";
    pub const CONFLICTS_RETRIED: &str = "distribution.conflicts.retried";
    pub const STORAGE_TIMEOUTS: &str = "distribution.errors.storage_timeout";

    pub const APPLY_LATENCY: &str = "distribution.apply.latency_seconds";
    pub const DISTRIBUTE_LATENCY: &str = "distribution.manual.latency_seconds";

    pub const RULES_LOADED: &str = "distribution.rules.loaded";
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

        registry.inc_counter(metric_names::EVENTS_APPLIED).await;
        registry.add_counter(metric_names::EVENTS_APPLIED, 4).await;

        assert_eq!(registry.get_counter(metric_names::EVENTS_APPLIED).await, 5);
        assert_eq!(registry.get_counter("never.touched").await, 0);
    }

    #[tokio::test]
    async fn test_gauge_overwrites() {
        let registry = MetricsRegistry::new();

        registry.set_gauge(metric_names::RULES_LOADED, 5).await;
        registry.set_gauge(metric_names::RULES_LOADED, 3).await;
        assert_eq!(registry.get_gauge(metric_names::RULES_LOADED).await, 3);
    }

    #[tokio::test]
    async fn test_timed_records_histogram() {
        let registry = MetricsRegistry::new();

        let value = timed(&registry, metric_names::APPLY_LATENCY, async { 7 }).await;
        assert_eq!(value, 7);

        let json = registry.to_json().await;
        assert_eq!(json["histograms"][metric_names::APPLY_LATENCY]["count"], 1);
    }

    #[tokio::test]
    async fn test_prometheus_format() {
        let registry = MetricsRegistry::new();

        registry.inc_counter(metric_names::EVENTS_APPENDED).await;
        registry.observe_histogram(metric_names::APPLY_LATENCY, 0.002).await;

        let text = registry.to_prometheus().await;
        assert!(text.contains("# TYPE distribution_events_appended counter"));
        assert!(text.contains("distribution_events_appended 1"));
        assert!(text.contains("distribution_apply_latency_seconds_bucket{le=\"0.0025\"} 1"));
        assert!(text.contains("distribution_apply_latency_seconds_count 1"));
    }

    #[test]
    fn test_histogram_overflow_bucket() {
        let histogram = Histogram::new(vec![0.1, 1.0]);
        histogram.observe(5.0);

        let json = histogram.to_json();
        assert_eq!(json["counts"], serde_json::json!([0, 0]));
        assert_eq!(json["count"], 1);
    }
}
