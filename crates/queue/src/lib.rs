//! Consumes cloud events from the queue and republishes them onto the
//! internal bus, filtered to instances that belong to this cluster.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod api;
mod error;

pub use api::{Ec2Api, Ec2Instance, Ec2Instances, QueueMessage, SqsApi, SqsQueue};
pub use error::{Error, Result};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use esdrain_bus::{Bus, Topic};
use esdrain_events::{BusEvent, CloudEvent, DetailRegistry};
use futures::future::join_all;
use prometheus::IntCounter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Options for creating a new [`QueueEmitter`].
pub struct QueueEmitterOptions<S, E> {
    /// The queue to consume.
    pub sqs: Arc<S>,

    /// The instance describer used for membership filtering.
    pub ec2: Arc<E>,

    /// The bus to republish surviving events onto.
    pub bus: Bus<BusEvent>,

    /// Name of the cluster; instances whose `Name` tag does not start with
    /// it are not ours. Empty disables the tag filter.
    pub cluster_name: String,

    /// Registry used to decode envelopes.
    pub registry: &'static DetailRegistry,

    /// Counter of received messages, if instrumented.
    pub received: Option<IntCounter>,

    /// Counter of deleted messages, if instrumented.
    pub deleted: Option<IntCounter>,
}

/// Long-poll loop that pulls cloud events off the queue, keeps the ones for
/// instances in this cluster, emits them on the bus keyed by
/// `(source, detail-type)`, and batch-deletes handled messages.
///
/// Messages with an unregistered detail type are left in the queue to
/// expire; malformed messages are deleted so they cannot poison the queue.
/// A message is only deleted after every bus emit for it has completed.
pub struct QueueEmitter<S, E> {
    sqs: Arc<S>,
    ec2: Arc<E>,
    bus: Bus<BusEvent>,
    cluster_name: String,
    registry: &'static DetailRegistry,
    received: Option<IntCounter>,
    deleted: Option<IntCounter>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl<S: SqsApi, E: Ec2Api> QueueEmitter<S, E> {
    /// Creates a new `QueueEmitter`.
    #[must_use]
    pub fn new(
        QueueEmitterOptions {
            sqs,
            ec2,
            bus,
            cluster_name,
            registry,
            received,
            deleted,
        }: QueueEmitterOptions<S, E>,
    ) -> Self {
        Self {
            sqs,
            ec2,
            bus,
            cluster_name,
            registry,
            received,
            deleted,
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Starts the consume loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if the consumer was started before.
    pub fn start(&self) -> Result<JoinHandle<Result<()>>> {
        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyStarted);
        }

        let handle = self.task_tracker.spawn(Self::run(
            self.sqs.clone(),
            self.ec2.clone(),
            self.bus.clone(),
            self.cluster_name.clone(),
            self.registry,
            self.received.clone(),
            self.deleted.clone(),
            self.shutdown_token.clone(),
        ));
        self.task_tracker.close();

        Ok(handle)
    }

    /// Stops the consume loop and waits for it to exit.
    pub async fn shutdown(&self) {
        info!("queue emitter shutting down...");

        self.shutdown_token.cancel();
        self.task_tracker.wait().await;

        info!("queue emitter shutdown complete");
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        sqs: Arc<S>,
        ec2: Arc<E>,
        bus: Bus<BusEvent>,
        cluster_name: String,
        registry: &'static DetailRegistry,
        received: Option<IntCounter>,
        deleted: Option<IntCounter>,
        shutdown_token: CancellationToken,
    ) -> Result<()> {
        loop {
            let messages = tokio::select! {
                () = shutdown_token.cancelled() => return Ok(()),
                messages = sqs.receive() => messages?,
            };
            if let Some(counter) = &received {
                counter.inc_by(messages.len() as u64);
            }
            if messages.is_empty() {
                continue;
            }

            let handled =
                Self::process_batch(&ec2, &bus, &cluster_name, registry, messages).await;
            if !handled.is_empty() {
                sqs.delete_batch(&handled).await?;
                if let Some(counter) = &deleted {
                    counter.inc_by(handled.len() as u64);
                }
            }
        }
    }

    /// Decodes, filters, and emits one receive batch. Returns the messages
    /// that were handled and may now be deleted.
    async fn process_batch(
        ec2: &E,
        bus: &Bus<BusEvent>,
        cluster_name: &str,
        registry: &'static DetailRegistry,
        messages: Vec<QueueMessage>,
    ) -> Vec<QueueMessage> {
        let mut to_delete = Vec::with_capacity(messages.len());
        let mut by_instance: HashMap<String, Vec<(QueueMessage, Arc<CloudEvent>)>> =
            HashMap::new();

        for message in messages {
            match registry.decode(message.body.as_bytes()) {
                Ok(event) => {
                    let instance_id = event.detail.instance_id().to_owned();
                    by_instance
                        .entry(instance_id)
                        .or_default()
                        .push((message, Arc::new(event)));
                }
                Err(error) if error.is_unknown_detail_type() => {
                    // Not ours to handle; leave it to expire in the queue.
                    debug!(%error, "skipping message with unregistered detail type");
                }
                Err(error) => {
                    warn!(%error, "malformed cloud event, deleting message");
                    to_delete.push(message);
                }
            }
        }

        if by_instance.is_empty() {
            return to_delete;
        }

        // One describe call for the whole batch.
        let instance_ids: Vec<String> = by_instance.keys().cloned().collect();
        let members: HashSet<String> = match ec2.cluster_members(cluster_name, &instance_ids).await
        {
            Ok(instances) => instances.into_iter().map(|i| i.instance_id).collect(),
            Err(error) => {
                // The instances no longer exist or cannot be described;
                // their events are not ours.
                warn!(%error, "describe-instances failed, treating batch as outside the cluster");
                HashSet::new()
            }
        };

        let mut emits = Vec::new();
        for (instance_id, entries) in by_instance {
            let ours = members.contains(&instance_id);
            for (message, event) in entries {
                if ours {
                    let topic = Topic::of(&event.source, &event.detail_type);
                    emits.push(bus.emit(&topic, BusEvent::Cloud(event)));
                } else {
                    debug!(%instance_id, "event for instance outside the cluster, ignoring");
                }
                to_delete.push(message);
            }
        }

        // Deletes must not be issued before every emit has completed.
        join_all(emits.into_iter().map(esdrain_bus::EmitHandle::wait)).await;

        to_delete
    }
}
