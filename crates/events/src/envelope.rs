use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::Value;

use crate::detail::{
    Detail, RebalanceRecommendation, SpotInterruption, TerminateAction, DETAIL_REBALANCE_RECOMMENDATION,
    DETAIL_SPOT_INTERRUPTION, DETAIL_TERMINATE_ACTION, SOURCE_AUTOSCALING, SOURCE_EC2,
};
use crate::error::{Error, Result};

/// A cloud event envelope with its decoded detail payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudEvent {
    /// Unique event ID.
    pub id: String,

    /// Emitting service, e.g. `aws.ec2`.
    pub source: String,

    /// The detail-type naming the payload shape.
    pub detail_type: String,

    /// The account the event was emitted in.
    pub account: String,

    /// The region the event was emitted in.
    pub region: String,

    /// When the event was emitted.
    pub time: DateTime<Utc>,

    /// ARNs of the resources the event refers to.
    pub resources: Vec<String>,

    /// The decoded detail payload.
    pub detail: Detail,
}

/// First decode pass: the outer envelope with the detail left raw.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: String,
    source: String,
    #[serde(rename = "detail-type")]
    detail_type: String,
    #[serde(default)]
    account: String,
    #[serde(default)]
    region: String,
    time: DateTime<Utc>,
    #[serde(default)]
    resources: Vec<String>,
    detail: Value,
}

/// Decoder for one registered detail shape.
pub type DetailDecoder = fn(&Value) -> serde_json::Result<Detail>;

/// Maps `(source, detail-type)` pairs to their payload decoders.
///
/// Decoding is two-pass: the outer envelope is parsed first to find the
/// pair, then the raw `detail` is parsed against the registered shape.
pub struct DetailRegistry {
    decoders: HashMap<(String, String), DetailDecoder>,
}

impl DetailRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registers a decoder for a `(source, detail-type)` pair.
    ///
    /// Registration must be completed before any decode call; the standard
    /// registry ([`standard`]) carries the closed set this system handles.
    pub fn register(&mut self, source: &str, detail_type: &str, decoder: DetailDecoder) {
        self.decoders
            .insert((source.to_owned(), detail_type.to_owned()), decoder);
    }

    /// Decodes a cloud event envelope from raw message bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if the bytes are not a valid envelope
    /// or the detail does not match its registered shape, and
    /// [`Error::UnknownDetailType`] if the `(source, detail-type)` pair has
    /// no decoder. Neither case panics the caller.
    pub fn decode(&self, body: &[u8]) -> Result<CloudEvent> {
        let raw: RawEnvelope = serde_json::from_slice(body).map_err(Error::Malformed)?;
        let decoder = self
            .decoders
            .get(&(raw.source.clone(), raw.detail_type.clone()))
            .ok_or_else(|| Error::UnknownDetailType {
                event_source: raw.source.clone(),
                detail_type: raw.detail_type.clone(),
            })?;
        let detail = decoder(&raw.detail).map_err(Error::Malformed)?;

        Ok(CloudEvent {
            id: raw.id,
            source: raw.source,
            detail_type: raw.detail_type,
            account: raw.account,
            region: raw.region,
            time: raw.time,
            resources: raw.resources,
            detail,
        })
    }
}

impl Default for DetailRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static STANDARD: Lazy<DetailRegistry> = Lazy::new(|| {
    let mut registry = DetailRegistry::new();
    registry.register(SOURCE_EC2, DETAIL_SPOT_INTERRUPTION, |v| {
        Ok(Detail::SpotInterruption(serde_json::from_value::<
            SpotInterruption,
        >(v.clone())?))
    });
    registry.register(SOURCE_EC2, DETAIL_REBALANCE_RECOMMENDATION, |v| {
        Ok(Detail::RebalanceRecommendation(serde_json::from_value::<
            RebalanceRecommendation,
        >(v.clone())?))
    });
    registry.register(SOURCE_AUTOSCALING, DETAIL_TERMINATE_ACTION, |v| {
        Ok(Detail::TerminateAction(serde_json::from_value::<
            TerminateAction,
        >(v.clone())?))
    });
    registry
});

/// The process-wide registry carrying the closed detail-type set.
#[must_use]
pub fn standard() -> &'static DetailRegistry {
    &STANDARD
}
