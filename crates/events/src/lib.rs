//! Cloud event envelopes, detail payloads, and lifecycle actions.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod action;
mod detail;
mod envelope;
mod error;

pub use action::LifecycleAction;
pub use detail::{
    Detail, RebalanceRecommendation, SpotInterruption, TerminateAction,
    DETAIL_REBALANCE_RECOMMENDATION, DETAIL_SPOT_INTERRUPTION, DETAIL_TERMINATE_ACTION,
    SOURCE_AUTOSCALING, SOURCE_EC2,
};
pub use envelope::{standard, CloudEvent, DetailDecoder, DetailRegistry};
pub use error::{Error, Result};

use std::sync::Arc;

/// Payload carried on the internal event bus.
#[derive(Clone, Debug)]
pub enum BusEvent {
    /// A decoded cloud event republished from the queue.
    Cloud(Arc<CloudEvent>),

    /// A per-node cluster-state notification; carries the node name.
    Node(String),
}

impl BusEvent {
    /// The cloud event, if this is a cloud payload.
    #[must_use]
    pub fn as_cloud(&self) -> Option<&Arc<CloudEvent>> {
        match self {
            Self::Cloud(event) => Some(event),
            Self::Node(_) => None,
        }
    }
}
