//! Per-node execution metrics.
//!
//! A bounded ring buffer of samples per node identifier, appended after
//! every execution. Parallel executions of different nodes append
//! concurrently, so the store serializes internally.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSample {
    pub duration_ms: u64,
    pub memory_bytes: u64,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregates over a node's retained samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub executions: usize,
    pub failures: usize,
    pub avg_duration_ms: f64,
    pub max_duration_ms: u64,
    pub max_memory_bytes: u64,
}

/// Bounded per-node ring buffer of [`ExecutionSample`]s.
pub struct MetricsStore {
    capacity: usize,
    inner: Mutex<HashMap<String, VecDeque<ExecutionSample>>>,
}

impl MetricsStore {
    /// Samples retained per node before the oldest are evicted.
    pub const DEFAULT_CAPACITY: usize = 50;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Append a sample for `node_id`, evicting the oldest past capacity.
    pub fn record(&self, node_id: &str, sample: ExecutionSample) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let ring = inner.entry(node_id.to_string()).or_default();
        ring.push_back(sample);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
    }

    /// Retained samples for `node_id`, oldest first.
    pub fn samples(&self, node_id: &str) -> Vec<ExecutionSample> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .get(node_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Aggregate the retained samples for `node_id`.
    pub fn summary(&self, node_id: &str) -> Option<MetricsSummary> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let ring = inner.get(node_id).filter(|r| !r.is_empty())?;

        let executions = ring.len();
        let failures = ring.iter().filter(|s| !s.success).count();
        let total_ms: u64 = ring.iter().map(|s| s.duration_ms).sum();

        Some(MetricsSummary {
            executions,
            failures,
            avg_duration_ms: total_ms as f64 / executions as f64,
            max_duration_ms: ring.iter().map(|s| s.duration_ms).max().unwrap_or(0),
            max_memory_bytes: ring.iter().map(|s| s.memory_bytes).max().unwrap_or(0),
        })
    }

    /// Drop all samples for `node_id` (the node was deleted).
    pub fn forget(&self, node_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(node_id);
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
