use prometheus::{IntCounter, IntGauge, Opts, Registry};

use crate::error::Result;

const NAMESPACE: &str = "esdrain_drainer";

/// App-specific Prometheus metrics.
pub struct Instrumentation {
    registry: Registry,

    /// Successful cluster-state polls.
    pub polls_total: IntCounter,

    /// Cluster-state polls that failed and left the old snapshot in place.
    pub poll_errors_total: IntCounter,

    /// Cloud events received from the queue.
    pub messages_received: IntCounter,

    /// Queue messages deleted after handling.
    pub messages_deleted: IntCounter,

    /// Spot interruption warnings handled.
    pub spot_interruptions: IntCounter,

    /// Rebalance recommendations handled.
    pub rebalance_recommendations: IntCounter,

    /// Terminate lifecycle actions received.
    pub terminate_actions_total: IntCounter,

    /// Terminate lifecycle actions currently being handled.
    pub terminate_actions_in_progress: IntGauge,

    /// Lifecycle action heartbeats successfully recorded.
    pub heartbeats_recorded_total: IntCounter,

    /// Bus deliveries dropped because a subscriber fell behind.
    pub bus_dropped_deliveries: IntGauge,
}

impl Instrumentation {
    /// Creates the metric set and registers it on a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric cannot be registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let polls_total = counter(&registry, "polls_total", "Successful cluster-state polls.")?;
        let poll_errors_total = counter(
            &registry,
            "poll_errors_total",
            "Cluster-state polls that failed; the previous snapshot stays.",
        )?;
        let messages_received = counter(
            &registry,
            "queue_messages_received_total",
            "Cloud event messages received from the queue.",
        )?;
        let messages_deleted = counter(
            &registry,
            "queue_messages_deleted_total",
            "Queue messages deleted after handling.",
        )?;
        let spot_interruptions = counter(
            &registry,
            "spot_interruptions_total",
            "Spot interruption warnings handled.",
        )?;
        let rebalance_recommendations = counter(
            &registry,
            "rebalance_recommendations_total",
            "Rebalance recommendations handled.",
        )?;
        let terminate_actions_total = counter(
            &registry,
            "terminate_actions_total",
            "Terminate lifecycle actions received.",
        )?;
        let heartbeats_recorded_total = counter(
            &registry,
            "heartbeats_recorded_total",
            "Lifecycle action heartbeats successfully recorded.",
        )?;

        let terminate_actions_in_progress = IntGauge::with_opts(
            Opts::new(
                "terminate_actions_in_progress",
                "Terminate lifecycle actions currently being handled.",
            )
            .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(terminate_actions_in_progress.clone()))?;

        let bus_dropped_deliveries = IntGauge::with_opts(
            Opts::new(
                "bus_dropped_deliveries",
                "Bus deliveries dropped because a subscriber fell behind.",
            )
            .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(bus_dropped_deliveries.clone()))?;

        Ok(Self {
            registry,
            polls_total,
            poll_errors_total,
            messages_received,
            messages_deleted,
            spot_interruptions,
            rebalance_recommendations,
            terminate_actions_total,
            terminate_actions_in_progress,
            heartbeats_recorded_total,
            bus_dropped_deliveries,
        })
    }

    /// The registry the metrics are registered on.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
