use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RoleLabel {
    Generator,
    Listener,
    Restarting,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RoleLabels {
    pub role: RoleLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum FailoverResult {
    Promoted,
    NoCandidate,
    AlreadyClaimed,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailoverLabels {
    pub result: FailoverResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ProbeResult {
    Alive,
    Unresponsive,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProbeLabels {
    pub result: ProbeResult,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by a worker.
pub struct Metrics {
    // -- generator --
    pub messages_produced: Counter,
    pub lease_renewal_failures: Counter,

    // -- listener --
    pub messages_consumed: Counter,
    pub messages_errored: Counter,

    // -- watcher --
    pub probes: Family<ProbeLabels, Counter>,
    pub listeners_pruned: Counter,
    pub failovers: Family<FailoverLabels, Counter>,

    // -- coordinator --
    pub role_transitions: Family<RoleLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let messages_produced = Counter::default();
        registry.register(
            "workerpool_messages_produced",
            "Messages pushed to the message queue by the generator",
            messages_produced.clone(),
        );

        let lease_renewal_failures = Counter::default();
        registry.register(
            "workerpool_lease_renewal_failures",
            "Generator lease renewals that failed and caused a step-down",
            lease_renewal_failures.clone(),
        );

        let messages_consumed = Counter::default();
        registry.register(
            "workerpool_messages_consumed",
            "Messages popped from the message queue by the listener",
            messages_consumed.clone(),
        );

        let messages_errored = Counter::default();
        registry.register(
            "workerpool_messages_errored",
            "Consumed messages moved to the error queue",
            messages_errored.clone(),
        );

        let probes = Family::<ProbeLabels, Counter>::default();
        registry.register(
            "workerpool_probes",
            "Liveness probes issued by the watcher, by result",
            probes.clone(),
        );

        let listeners_pruned = Counter::default();
        registry.register(
            "workerpool_listeners_pruned",
            "Unresponsive listeners removed from the listener set",
            listeners_pruned.clone(),
        );

        let failovers = Family::<FailoverLabels, Counter>::default();
        registry.register(
            "workerpool_failovers",
            "Generator failover attempts by result",
            failovers.clone(),
        );

        let role_transitions = Family::<RoleLabels, Counter>::default();
        registry.register(
            "workerpool_role_transitions",
            "Role transitions of this worker by target role",
            role_transitions.clone(),
        );

        Self {
            messages_produced,
            lease_renewal_failures,
            messages_consumed,
            messages_errored,
            probes,
            listeners_pruned,
            failovers,
            role_transitions,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, shared by every component.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all worker metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
