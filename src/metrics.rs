use std::sync::Arc;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: Operation,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Operation {
    Get,
    Set,
    Keys,
    Clear,
    Delete,
    MultiRead,
    MultiWrite,
    IsEmpty,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the store.
pub struct Metrics {
    // -- store --
    pub store_operations: Family<OperationLabels, Counter>,

    // -- locks --
    pub lock_acquisitions: Counter,
    pub lock_polls: Counter,
    pub lock_expired_entries: Counter,
    pub lock_hold_seconds: Histogram,

    // -- pool --
    pub pool_checkouts: Counter,
    pub pool_connections_open: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let store_operations = Family::<OperationLabels, Counter>::default();
        registry.register(
            "scopestore_operations",
            "Store operations that reached the engine, by operation",
            store_operations.clone(),
        );

        let lock_acquisitions = Counter::default();
        registry.register(
            "scopestore_lock_acquisitions",
            "Distributed lock acquisitions",
            lock_acquisitions.clone(),
        );

        let lock_polls = Counter::default();
        registry.register(
            "scopestore_lock_polls",
            "Lock head polls that found another waiter first",
            lock_polls.clone(),
        );

        let lock_expired_entries = Counter::default();
        registry.register(
            "scopestore_lock_expired_entries",
            "Acquisitions granted because the lock queue expired",
            lock_expired_entries.clone(),
        );

        let lock_hold_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 16));
        registry.register(
            "scopestore_lock_hold_seconds",
            "Time spent inside the guarded block",
            lock_hold_seconds.clone(),
        );

        let pool_checkouts = Counter::default();
        registry.register(
            "scopestore_pool_checkouts",
            "Connections checked out of endpoint pools",
            pool_checkouts.clone(),
        );

        let pool_connections_open: Gauge = Gauge::default();
        registry.register(
            "scopestore_pool_connections_open",
            "Engine connections currently open across all pools",
            pool_connections_open.clone(),
        );

        Self {
            store_operations,
            lock_acquisitions,
            lock_polls,
            lock_expired_entries,
            lock_hold_seconds,
            pool_checkouts,
            pool_connections_open,
        }
    }

    pub fn record_operation(&self, operation: Operation) {
        self.store_operations
            .get_or_create(&OperationLabels { operation })
            .inc();
    }

    pub fn operation_count(&self, operation: Operation) -> u64 {
        self.store_operations
            .get_or_create(&OperationLabels { operation })
            .get()
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, owned by the pool registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all store metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the OpenMetrics text exposition.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        // Writing into a String cannot fail.
        let _ = encode(&mut buffer, &self.registry);
        buffer
    }
}
