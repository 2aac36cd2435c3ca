use std::sync::{Arc, Mutex};

use esdrain_bus::{Bus, Topic};
use esdrain_es::{EsFacade, EsTransport};
use esdrain_events::{
    BusEvent, CloudEvent, LifecycleAction, DETAIL_REBALANCE_RECOMMENDATION,
    DETAIL_SPOT_INTERRUPTION, DETAIL_TERMINATE_ACTION, SOURCE_AUTOSCALING, SOURCE_EC2,
};
use esdrain_lifecycle::{AutoScalingApi, LifecycleActionPostponer, ACTION_RESULT_CONTINUE};
use esdrain_queue::{Ec2Api, QueueEmitter, SqsApi};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::health::ReadyState;
use crate::instrumentation::Instrumentation;
use crate::reconciler::{Reconciler, NODE_EMPTY, NODE_REMOVED};

/// Options for creating a new [`App`].
pub struct AppOptions<T, S, E, A> {
    /// The shared event bus.
    pub bus: Bus<BusEvent>,

    /// The Elasticsearch facade.
    pub facade: Arc<EsFacade<T>>,

    /// The state reconciler.
    pub reconciler: Arc<Reconciler<T>>,

    /// The queue consumer.
    pub emitter: QueueEmitter<S, E>,

    /// The lifecycle action postponer.
    pub postponer: LifecycleActionPostponer<A>,

    /// The AutoScaling seam, shared with the postponer.
    pub asg: Arc<A>,

    /// Metrics.
    pub inst: Arc<Instrumentation>,

    /// Readiness flags.
    pub ready: Arc<ReadyState>,
}

/// The drainer's top-level loop.
///
/// Starts the reconciler and queue consumer, dispatches interruption and
/// terminate events to handlers, and shuts everything down on the first
/// non-recoverable error. Handlers run concurrently, one per event.
pub struct App<T, S, E, A> {
    bus: Bus<BusEvent>,
    facade: Arc<EsFacade<T>>,
    reconciler: Arc<Reconciler<T>>,
    emitter: Arc<QueueEmitter<S, E>>,
    postponer: Arc<LifecycleActionPostponer<A>>,
    asg: Arc<A>,
    inst: Arc<Instrumentation>,
    ready: Arc<ReadyState>,
    shutdown_token: CancellationToken,
    first_error: Mutex<Option<Error>>,
}

impl<T, S, E, A> App<T, S, E, A>
where
    T: EsTransport,
    S: SqsApi,
    E: Ec2Api,
    A: AutoScalingApi,
{
    /// Creates a new `App`.
    #[must_use]
    pub fn new(
        AppOptions {
            bus,
            facade,
            reconciler,
            emitter,
            postponer,
            asg,
            inst,
            ready,
        }: AppOptions<T, S, E, A>,
    ) -> Self {
        Self {
            bus,
            facade,
            reconciler,
            emitter: Arc::new(emitter),
            postponer: Arc::new(postponer),
            asg,
            inst,
            ready,
            shutdown_token: CancellationToken::new(),
            first_error: Mutex::new(None),
        }
    }

    /// Asks the app to shut down cleanly.
    pub fn trigger_shutdown(&self) {
        self.shutdown_token.cancel();
    }

    /// Runs until shutdown is triggered or a subsystem fails.
    ///
    /// # Errors
    ///
    /// Returns the first non-recoverable error; the process should exit
    /// non-zero in that case.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        // Poll once synchronously so an initial snapshot exists before any
        // event can arrive.
        self.reconciler.reconcile_once().await?;
        self.ready.set_polled_once();

        let mut spot = self.bus.on(Topic::of(SOURCE_EC2, DETAIL_SPOT_INTERRUPTION));
        let mut rebalance = self
            .bus
            .on(Topic::of(SOURCE_EC2, DETAIL_REBALANCE_RECOMMENDATION));
        let mut terminate = self
            .bus
            .on(Topic::of(SOURCE_AUTOSCALING, DETAIL_TERMINATE_ACTION));

        let mut reconciler_handle = self.reconciler.clone().start()?;
        let mut emitter_handle = self.emitter.start()?;

        let handlers = TaskTracker::new();
        info!("drainer started");

        loop {
            tokio::select! {
                () = self.shutdown_token.cancelled() => break,

                result = &mut reconciler_handle => {
                    self.record_subsystem_exit("reconciler", result);
                    break;
                }

                result = &mut emitter_handle => {
                    self.record_subsystem_exit("queue emitter", result);
                    break;
                }

                event = spot.recv() => {
                    let Some(event) = event else {
                        self.record_fatal(Error::ListenerClosed);
                        break;
                    };
                    if let BusEvent::Cloud(event) = event {
                        self.inst.spot_interruptions.inc();
                        Self::spawn_drain_only(&self, &handlers, event);
                    }
                }

                event = rebalance.recv() => {
                    let Some(event) = event else {
                        self.record_fatal(Error::ListenerClosed);
                        break;
                    };
                    if let BusEvent::Cloud(event) = event {
                        self.inst.rebalance_recommendations.inc();
                        Self::spawn_drain_only(&self, &handlers, event);
                    }
                }

                event = terminate.recv() => {
                    let Some(event) = event else {
                        self.record_fatal(Error::ListenerClosed);
                        break;
                    };
                    if let BusEvent::Cloud(event) = event {
                        self.inst.terminate_actions_total.inc();
                        Self::spawn_terminate(&self, &handlers, event);
                    }
                }
            }
        }

        self.shutdown_token.cancel();
        handlers.close();
        handlers.wait().await;
        self.emitter.shutdown().await;
        self.reconciler.shutdown().await;

        if let Some(err) = self.first_error.lock().expect("lock poisoned").take() {
            self.ready.set_failed();
            return Err(err);
        }
        info!("drainer stopped");
        Ok(())
    }

    /// Handles a spot interruption or rebalance recommendation.
    ///
    /// The ~2 minutes' notice is rarely enough to fully move the shards,
    /// but draining lets Elasticsearch promote replicas elsewhere, so a
    /// single drain call and a quick return is the right move.
    fn spawn_drain_only(app: &Arc<Self>, handlers: &TaskTracker, event: Arc<CloudEvent>) {
        let app = app.clone();
        handlers.spawn(async move {
            let instance_id = event.detail.instance_id().to_owned();
            if let Err(err) = app.facade.drain_nodes(&[instance_id]).await {
                app.record_fatal(err.into());
            }
        });
    }

    fn spawn_terminate(app: &Arc<Self>, handlers: &TaskTracker, event: Arc<CloudEvent>) {
        let app = app.clone();
        app.inst.terminate_actions_in_progress.inc();
        handlers.spawn(async move {
            let result = app.handle_terminate(event).await;
            app.inst.terminate_actions_in_progress.dec();
            match result {
                Ok(()) => {}
                Err(err) if err.is_event_level() => {
                    warn!(%err, "ignoring unusable terminate event");
                }
                Err(err) => app.record_fatal(err),
            }
        });
    }

    /// Drains the node named by a terminate lifecycle action, holds the
    /// hook open until the node is empty or gone, then lets the
    /// AutoScaling Group continue.
    async fn handle_terminate(&self, event: Arc<CloudEvent>) -> Result<()> {
        let action = LifecycleAction::try_from(event.as_ref())?;

        self.facade
            .drain_nodes(std::slice::from_ref(&action.instance_id))
            .await?;

        let outer = self.shutdown_token.child_token();
        let postpone = outer.child_token();

        // Waits for the node to reach a terminal state. First event cancels
        // the postponer (normal completion); a closed channel without an
        // event cancels the outer scope (abnormal).
        let waiter = {
            let mut empty = self.bus.once(Topic::of(NODE_EMPTY, &action.instance_id));
            let mut removed = self.bus.once(Topic::of(NODE_REMOVED, &action.instance_id));
            let outer = outer.clone();
            let postpone = postpone.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = postpone.cancelled() => {}
                    event = empty.recv() => match event {
                        Some(_) => postpone.cancel(),
                        None => outer.cancel(),
                    },
                    event = removed.recv() => match event {
                        Some(_) => postpone.cancel(),
                        None => outer.cancel(),
                    },
                }
            })
        };

        let result = self.postponer.postpone(&postpone, &action).await;
        postpone.cancel();
        let _ = waiter.await;

        match result {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {}
            Err(err) if err.is_timeout() => {
                // Losing the hook is not worth stopping the world; it will
                // time out on its own and the group proceeds.
                error!(instance = %action.instance_id, "lifecycle action timed out");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        if let Err(err) = self
            .asg
            .complete_lifecycle_action(&action, ACTION_RESULT_CONTINUE)
            .await
        {
            // The hook eventually times out on its own, so this is
            // best-effort.
            warn!(%err, "error while completing termination lifecycle action");
        }
        Ok(())
    }

    fn record_subsystem_exit<X: Into<Error>>(
        &self,
        name: &'static str,
        result: std::result::Result<std::result::Result<(), X>, JoinError>,
    ) {
        match result {
            Ok(Ok(())) => {
                if !self.shutdown_token.is_cancelled() {
                    self.record_fatal(Error::SubsystemExited(name));
                }
            }
            Ok(Err(err)) => self.record_fatal(err.into()),
            Err(join) => self.record_fatal(Error::Join(join)),
        }
    }

    fn record_fatal(&self, err: Error) {
        error!(%err, "fatal error, shutting down");
        {
            let mut first = self.first_error.lock().expect("lock poisoned");
            if first.is_none() {
                *first = Some(err);
            }
        }
        self.shutdown_token.cancel();
    }
}
