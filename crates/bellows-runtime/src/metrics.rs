//! Per-operation call counters for forge API traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Counters for one `{operation, scope}` pair.
#[derive(Default)]
struct CallCounter {
    calls: AtomicU64,
    failures: AtomicU64,
}

/// Snapshot of one counter pair for exposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationMetric {
    pub operation: String,
    pub scope: String,
    pub calls: u64,
    pub failures: u64,
}

/// Registry of forge API call counters, keyed by operation and scope.
///
/// Scope is the owning entity's label (`repo:acme/widgets`, `org:acme`).
/// Failures count separately from calls so dashboards can derive rates.
#[derive(Clone, Default)]
pub struct CallMetrics {
    counters: Arc<RwLock<HashMap<(String, String), Arc<CallCounter>>>>,
}

impl CallMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, operation: &str, scope: &str) -> Arc<CallCounter> {
        if let Some(counter) = self
            .counters
            .read()
            .unwrap()
            .get(&(operation.to_string(), scope.to_string()))
        {
            return counter.clone();
        }
        let mut counters = self.counters.write().unwrap();
        counters
            .entry((operation.to_string(), scope.to_string()))
            .or_default()
            .clone()
    }

    /// Record one call.
    pub fn record_call(&self, operation: &str, scope: &str) {
        self.counter(operation, scope)
            .calls
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record one failed call.
    pub fn record_failure(&self, operation: &str, scope: &str) {
        self.counter(operation, scope)
            .failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot every counter, sorted by operation then scope.
    pub fn snapshot(&self) -> Vec<OperationMetric> {
        let counters = self.counters.read().unwrap();
        let mut metrics: Vec<_> = counters
            .iter()
            .map(|((operation, scope), counter)| OperationMetric {
                operation: operation.clone(),
                scope: scope.clone(),
                calls: counter.calls.load(Ordering::Relaxed),
                failures: counter.failures.load(Ordering::Relaxed),
            })
            .collect();
        metrics.sort_by(|a, b| (&a.operation, &a.scope).cmp(&(&b.operation, &b.scope)));
        metrics
    }
}
