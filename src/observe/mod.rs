//! Metrics collection and per-node outcome tracking.
//!
//! Counter/gauge/histogram primitives with labelled tags, plus a bounded
//! ring of recent outcomes per pipeline node. Both are explicitly
//! constructed services injected into the pipeline — no hidden globals.

mod breaker;

pub use breaker::{BreakerRegistry, BreakerState, CircuitBreaker};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

/// Metric primitive kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// One recorded metric point.
#[derive(Debug, Clone, Serialize)]
pub struct MetricPoint {
    pub name: String,
    pub value: f64,
    pub kind: MetricKind,
    pub tags: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated view of one metric name.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub kind: MetricKind,
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
}

/// Thread-safe in-process metrics collector.
#[derive(Default)]
pub struct MetricsCollector {
    points: Mutex<Vec<MetricPoint>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_counter(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.record(name, value, MetricKind::Counter, tags);
    }

    pub fn record_gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.record(name, value, MetricKind::Gauge, tags);
    }

    pub fn record_histogram(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.record(name, value, MetricKind::Histogram, tags);
    }

    fn record(&self, name: &str, value: f64, kind: MetricKind, tags: &[(&str, &str)]) {
        let point = MetricPoint {
            name: name.to_string(),
            value,
            kind,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            timestamp: Utc::now(),
        };
        if let Ok(mut points) = self.points.lock() {
            points.push(point);
        }
    }

    /// Aggregate all recorded points by name.
    pub fn summary(&self) -> BTreeMap<String, MetricSummary> {
        let points = match self.points.lock() {
            Ok(points) => points,
            Err(_) => return BTreeMap::new(),
        };

        let mut out: BTreeMap<String, MetricSummary> = BTreeMap::new();
        for point in points.iter() {
            let entry = out.entry(point.name.clone()).or_insert(MetricSummary {
                kind: point.kind,
                count: 0,
                sum: 0.0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                last: 0.0,
            });
            entry.count += 1;
            entry.sum += point.value;
            entry.min = entry.min.min(point.value);
            entry.max = entry.max.max(point.value);
            entry.last = point.value;
        }
        out
    }

    pub fn len(&self) -> usize {
        self.points.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of one node execution.
#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    pub node: String,
    pub success: bool,
    pub duration_ms: u64,
    pub input_bytes: usize,
    pub output_bytes: usize,
    pub retries: u32,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
}

/// Keeps the last N outcomes per node.
pub struct NodeTracker {
    rings: Mutex<HashMap<String, VecDeque<NodeOutcome>>>,
    capacity: usize,
}

impl NodeTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, outcome: NodeOutcome) {
        if let Ok(mut rings) = self.rings.lock() {
            let ring = rings.entry(outcome.node.clone()).or_default();
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(outcome);
        }
    }

    pub fn last_outcomes(&self, node: &str) -> Vec<NodeOutcome> {
        self.rings
            .lock()
            .map(|rings| rings.get(node).map(|r| r.iter().cloned().collect()).unwrap_or_default())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_aggregation() {
        let collector = MetricsCollector::new();
        collector.record_counter("kg_queries", 1.0, &[("query", "find_symbol")]);
        collector.record_counter("kg_queries", 1.0, &[("query", "get_text_nodes")]);
        collector.record_histogram("stage_duration_ms", 120.0, &[("stage", "pack")]);

        let summary = collector.summary();
        assert_eq!(summary["kg_queries"].count, 2);
        assert_eq!(summary["kg_queries"].sum, 2.0);
        assert_eq!(summary["stage_duration_ms"].kind, MetricKind::Histogram);
        assert_eq!(summary["stage_duration_ms"].last, 120.0);
    }

    #[test]
    fn test_tags_preserved_on_points() {
        let collector = MetricsCollector::new();
        collector.record_gauge("pack_items", 12.0, &[("repo", "octo/widgets")]);
        assert_eq!(collector.len(), 1);
    }

    #[test]
    fn test_node_ring_capacity() {
        let tracker = NodeTracker::new(3);
        for i in 0..5 {
            tracker.record(NodeOutcome {
                node: "kg_retrieval".to_string(),
                success: true,
                duration_ms: i,
                input_bytes: 0,
                output_bytes: 0,
                retries: 0,
                timed_out: false,
                error_class: None,
            });
        }

        let outcomes = tracker.last_outcomes("kg_retrieval");
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].duration_ms, 2);
        assert_eq!(outcomes[2].duration_ms, 4);
    }

    #[test]
    fn test_unknown_node_empty() {
        let tracker = NodeTracker::new(3);
        assert!(tracker.last_outcomes("nope").is_empty());
    }
}
