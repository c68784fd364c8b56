use prometheus_client::{
    metrics::{counter::Counter, histogram::Histogram},
    registry::{Registry, Unit},
};

#[derive(Clone, Debug, Default)]
pub struct QueueMetrics {
    pub(crate) jobs: Counter,
    pub(crate) deduplicated: Counter,
}

#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    pub(crate) passes: Counter,
    pub(crate) failures: Counter,
    pub(crate) policy_pushes: Counter,
    pub(crate) policy_push_skipped: Counter,
    pub(crate) address_group_updates: Counter,
    pub(crate) duration: Histogram,
}

// === impl QueueMetrics ===

impl QueueMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let jobs = Counter::default();
        prom.register(
            "queue_jobs",
            "Count of reconciliation jobs accepted by the dispatch queue",
            jobs.clone(),
        );

        let deduplicated = Counter::default();
        prom.register(
            "queue_jobs_deduplicated",
            "Count of reconciliation jobs dropped because the same resource was already queued",
            deduplicated.clone(),
        );

        Self { jobs, deduplicated }
    }
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();

        prom.register(
            "reconcile_passes",
            "Count of reconciliation passes",
            metrics.passes.clone(),
        );
        prom.register(
            "reconcile_failures",
            "Count of reconciliation passes that failed to apply the firewall policy",
            metrics.failures.clone(),
        );
        prom.register(
            "policy_pushes",
            "Count of firewall policy documents applied",
            metrics.policy_pushes.clone(),
        );
        prom.register(
            "policy_push_skipped",
            "Count of passes that skipped pushing an unchanged firewall policy",
            metrics.policy_push_skipped.clone(),
        );
        prom.register(
            "address_group_updates",
            "Count of address group updates submitted",
            metrics.address_group_updates.clone(),
        );
        prom.register_with_unit(
            "reconcile_duration",
            "Histogram of reconciliation pass durations",
            Unit::Seconds,
            metrics.duration.clone(),
        );

        metrics
    }
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            passes: Counter::default(),
            failures: Counter::default(),
            policy_pushes: Counter::default(),
            policy_push_skipped: Counter::default(),
            address_group_updates: Counter::default(),
            // Passes include backend round trips, which may take several seconds.
            duration: Histogram::new([0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        }
    }
}
