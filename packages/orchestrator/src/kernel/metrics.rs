//! Metrics sink capability.
//!
//! The orchestrator emits counters and gauges through this trait; wiring a
//! real exporter is an external concern. The in-memory sink doubles as the
//! backing for `/api/metrics` and for test assertions.

use std::collections::HashMap;
use std::sync::Mutex;

pub trait MetricsSink: Send + Sync {
    fn incr(&self, name: &str, by: u64);
    fn gauge(&self, name: &str, value: f64);
    fn snapshot(&self) -> MetricsSnapshot;
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
}

#[derive(Default)]
pub struct MemoryMetricsSink {
    inner: Mutex<MetricsSnapshot>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn incr(&self, name: &str, by: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner.counters.entry(name.to_string()).or_insert(0) += by;
        }
    }

    fn gauge(&self, name: &str, value: f64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.gauges.insert(name.to_string(), value);
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|inner| inner.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let sink = MemoryMetricsSink::new();
        sink.incr("jobs_completed", 1);
        sink.incr("jobs_completed", 2);
        assert_eq!(sink.snapshot().counters["jobs_completed"], 3);
    }

    #[test]
    fn gauges_overwrite() {
        let sink = MemoryMetricsSink::new();
        sink.gauge("pool_utilization", 0.5);
        sink.gauge("pool_utilization", 0.9);
        assert_eq!(sink.snapshot().gauges["pool_utilization"], 0.9);
    }
}
