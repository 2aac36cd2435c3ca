use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use esdrain_bus::{Bus, EmitHandle, Topic};
use esdrain_es::{ClusterState, EsFacade, EsTransport};
use esdrain_events::BusEvent;
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::instrumentation::Instrumentation;

/// Topic namespace for nodes that joined the cluster.
pub const NODE_ADDED: &str = "node-added";

/// Topic namespace for nodes that left the cluster.
pub const NODE_REMOVED: &str = "node-removed";

/// Topic namespace for nodes holding zero shards.
pub const NODE_EMPTY: &str = "node-empty";

/// Topic namespace for nodes still holding shards.
pub const NODE_NOT_EMPTY: &str = "node-not-empty";

/// Periodically refreshes the cluster-state snapshot, cleans up exclusions
/// for nodes that left, and emits per-node state events.
///
/// `node-empty`/`node-not-empty` are re-emitted for every node on every
/// tick on purpose: handlers subscribe after their event arrives and would
/// otherwise miss an earlier emission, so re-emitting bounds their wait to
/// one poll interval.
pub struct Reconciler<T> {
    facade: Arc<EsFacade<T>>,
    bus: Bus<BusEvent>,
    state: Arc<RwLock<Option<ClusterState>>>,
    poll_interval: Duration,
    inst: Arc<Instrumentation>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

/// Options for creating a new [`Reconciler`].
pub struct ReconcilerOptions<T> {
    /// The Elasticsearch facade.
    pub facade: Arc<EsFacade<T>>,

    /// The bus to emit node-state events on.
    pub bus: Bus<BusEvent>,

    /// How often to poll Elasticsearch.
    pub poll_interval: Duration,

    /// Metrics.
    pub inst: Arc<Instrumentation>,
}

impl<T: EsTransport> Reconciler<T> {
    /// Creates a new `Reconciler`.
    #[must_use]
    pub fn new(
        ReconcilerOptions {
            facade,
            bus,
            poll_interval,
            inst,
        }: ReconcilerOptions<T>,
    ) -> Self {
        Self {
            facade,
            bus,
            state: Arc::new(RwLock::new(None)),
            poll_interval,
            inst,
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// A clone of the most recent snapshot, if one exists.
    pub async fn current(&self) -> Option<ClusterState> {
        self.state.read().await.clone()
    }

    /// Runs one reconciliation tick.
    ///
    /// On failure the snapshot pointer is left untouched and nothing is
    /// emitted; the next tick retries.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster state cannot be fetched or departed
    /// nodes cannot be undrained.
    pub async fn reconcile_once(&self) -> Result<()> {
        // Write-exclusive for the whole tick so readers never observe a
        // snapshot that is mid-replacement.
        let mut current = self.state.write().await;

        let new_state = self.facade.get_state().await?;
        let (added, mut removed) = ClusterState::diff_nodes(current.as_ref(), Some(&new_state));

        // Exclusions for nodes no longer in the cluster are stale.
        let to_undrain: Vec<String> = new_state
            .exclusions
            .name
            .iter()
            .filter(|name| !new_state.has_node(name))
            .cloned()
            .collect();
        removed.extend(to_undrain.iter().cloned());
        let removed = uniq(removed);

        self.facade.undrain_nodes(&to_undrain).await?;

        let previous = current.replace(new_state);
        let state = current.as_ref().expect("snapshot was just installed");

        let mut emits: Vec<EmitHandle> =
            Vec::with_capacity(added.len() + removed.len() + state.nodes.len());
        for node in &added {
            emits.push(self.emit(NODE_ADDED, node));
        }
        for node in &removed {
            emits.push(self.emit(NODE_REMOVED, node));
        }
        for node in &state.nodes {
            let namespace = if state.shards.get(node).copied().unwrap_or(0) > 0 {
                NODE_NOT_EMPTY
            } else {
                NODE_EMPTY
            };
            emits.push(self.emit(namespace, node));
        }
        join_all(emits.into_iter().map(EmitHandle::wait)).await;

        if previous.is_none() {
            info!(nodes = state.nodes.len(), "initial cluster state installed");
        }
        Ok(())
    }

    fn emit(&self, namespace: &str, node: &str) -> EmitHandle {
        self.bus
            .emit(&Topic::of(namespace, node), BusEvent::Node(node.to_owned()))
    }

    /// Starts the poll ticker.
    ///
    /// # Errors
    ///
    /// Returns an error if the reconciler was already started.
    pub fn start(self: Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyStarted("reconciler"));
        }

        let reconciler = self.clone();
        let handle = self.task_tracker.spawn(async move {
            let mut ticker = tokio::time::interval(reconciler.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the first tick is immediate

            loop {
                tokio::select! {
                    () = reconciler.shutdown_token.cancelled() => return Ok(()),
                    _ = ticker.tick() => {
                        match reconciler.reconcile_once().await {
                            Ok(()) => reconciler.inst.polls_total.inc(),
                            Err(error) => {
                                reconciler.inst.poll_errors_total.inc();
                                warn!(%error, "cluster-state poll failed, keeping previous snapshot");
                            }
                        }
                    }
                }
            }
        });
        self.task_tracker.close();

        Ok(handle)
    }

    /// Stops the poll ticker and waits for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.task_tracker.wait().await;
    }
}

fn uniq(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(values.len());
    values.into_iter().filter(|v| seen.insert(v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutil::MockCluster;

    use esdrain_bus::DEFAULT_CAPACITY;
    use serde_json::Value;

    fn reconciler(cluster: MockCluster, bus: &Bus<BusEvent>) -> Arc<Reconciler<MockCluster>> {
        Arc::new(Reconciler::new(ReconcilerOptions {
            facade: Arc::new(EsFacade::new(cluster)),
            bus: bus.clone(),
            poll_interval: Duration::from_millis(10),
            inst: Arc::new(Instrumentation::new().unwrap()),
        }))
    }

    #[tokio::test]
    async fn test_initial_tick_installs_snapshot_and_emits() {
        let bus = Bus::new(DEFAULT_CAPACITY);
        let mut added = bus.on(Topic::of(NODE_ADDED, "10.0.0.1"));
        let mut empty = bus.on(Topic::of(NODE_EMPTY, "10.0.0.2"));
        let mut not_empty = bus.on(Topic::of(NODE_NOT_EMPTY, "10.0.0.1"));

        let cluster = MockCluster::new(&["10.0.0.1", "10.0.0.2"], &[("10.0.0.1", 5)]);
        let reconciler = reconciler(cluster, &bus);
        reconciler.reconcile_once().await.unwrap();

        assert!(reconciler.current().await.is_some());
        assert!(added.recv().await.is_some());
        assert!(empty.recv().await.is_some());
        assert!(not_empty.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_departed_exclusion_is_undrained_and_cleared() {
        let bus = Bus::new(DEFAULT_CAPACITY);
        let mut removed = bus.on(Topic::of(NODE_REMOVED, "10.0.0.9"));

        let cluster = MockCluster::new(&["10.0.0.1", "10.0.0.2"], &[]);
        cluster.set_excluded_names("10.0.0.9");
        let reconciler = reconciler(cluster, &bus);
        reconciler.reconcile_once().await.unwrap();

        // The only exclusion was removed, so the field was cleared to null.
        let body = reconciler.facade_for_tests().last_put().unwrap();
        assert_eq!(
            body["transient"]["cluster.routing.allocation.exclude"]["_name"],
            Value::Null
        );
        assert!(removed.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_previous_snapshot() {
        let bus = Bus::new(DEFAULT_CAPACITY);
        let cluster = MockCluster::new(&["10.0.0.1"], &[]);
        let reconciler = reconciler(cluster, &bus);
        reconciler.reconcile_once().await.unwrap();
        let before = reconciler.current().await.unwrap();

        let mut empty = bus.on(Topic::of(NODE_EMPTY, "10.0.0.1"));
        reconciler.facade_for_tests().fail_gets(true);
        assert!(reconciler.reconcile_once().await.is_err());

        assert_eq!(reconciler.current().await.unwrap(), before);
        // No emits happened on the failed tick.
        reconciler.facade_for_tests().fail_gets(false);
        reconciler.reconcile_once().await.unwrap();
        assert!(empty.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_state_events_reemitted_every_tick() {
        let bus = Bus::new(DEFAULT_CAPACITY);
        let cluster = MockCluster::new(&["10.0.0.1"], &[]);
        let reconciler = reconciler(cluster, &bus);
        reconciler.reconcile_once().await.unwrap();

        // A subscriber joining after the first tick still learns the state.
        let mut empty = bus.on(Topic::of(NODE_EMPTY, "10.0.0.1"));
        reconciler.reconcile_once().await.unwrap();
        assert!(empty.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_node_becomes_empty_after_drain() {
        let bus = Bus::new(DEFAULT_CAPACITY);
        let cluster = MockCluster::new(&["10.0.0.1", "10.0.0.2"], &[("10.0.0.1", 5)]);
        let reconciler = reconciler(cluster, &bus);
        reconciler.reconcile_once().await.unwrap();

        // Draining moves the shards off; the next tick reports empty.
        reconciler
            .facade_for_tests()
            .drain_and_relocate("10.0.0.1");
        let mut empty = bus.on(Topic::of(NODE_EMPTY, "10.0.0.1"));
        reconciler.reconcile_once().await.unwrap();
        assert!(empty.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_ticker_start_and_shutdown() {
        let bus = Bus::new(DEFAULT_CAPACITY);
        let cluster = MockCluster::new(&["10.0.0.1"], &[]);
        let reconciler = reconciler(cluster, &bus);

        let handle = reconciler.clone().start().unwrap();
        assert!(reconciler.clone().start().is_err());

        tokio::time::timeout(Duration::from_secs(5), async {
            while reconciler.current().await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("ticker never installed a snapshot");

        reconciler.shutdown().await;
        assert!(handle.await.unwrap().is_ok());
    }

    impl Reconciler<MockCluster> {
        fn facade_for_tests(&self) -> &MockCluster {
            self.facade.transport()
        }
    }
}
