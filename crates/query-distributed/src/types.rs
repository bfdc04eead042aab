//! Core types for distributed execution

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Unique identifier for a fan-out query call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    /// Create a new random query ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query-{}", &self.0.to_string()[..8])
    }
}

/// Counters for parallel execution
#[derive(Debug, Default)]
pub struct ExecutionStats {
    queries: AtomicU64,
    failed_queries: AtomicU64,
    timeouts: AtomicU64,
    node_calls: AtomicU64,
    rows_returned: AtomicU64,
}

impl ExecutionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_query(&self, node_calls: usize) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.node_calls.fetch_add(node_calls as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failed_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.failed_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rows(&self, rows: usize) {
        self.rows_returned.fetch_add(rows as u64, Ordering::Relaxed);
    }

    /// Snapshot of all counters
    pub fn snapshot(&self) -> ExecutionStatsSnapshot {
        ExecutionStatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            node_calls: self.node_calls.load(Ordering::Relaxed),
            rows_returned: self.rows_returned.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ExecutionStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionStatsSnapshot {
    pub queries: u64,
    pub failed_queries: u64,
    pub timeouts: u64,
    pub node_calls: u64,
    pub rows_returned: u64,
}

impl ExecutionStatsSnapshot {
    /// Fraction of queries that failed (0.0 - 1.0)
    pub fn failure_rate(&self) -> f64 {
        if self.queries == 0 {
            0.0
        } else {
            self.failed_queries as f64 / self.queries as f64
        }
    }
}
