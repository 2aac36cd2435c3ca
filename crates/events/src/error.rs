use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The envelope's (source, detail-type) pair has no registered decoder.
    /// Non-fatal; callers may skip the message and let it expire.
    #[error("no detail type registered for {event_source}/{detail_type}")]
    UnknownDetailType {
        /// The envelope's `source` field.
        event_source: String,
        /// The envelope's `detail-type` field.
        detail_type: String,
    },

    /// The message body is not a valid cloud event envelope, or the detail
    /// payload does not match its registered shape. Fatal for the message.
    #[error("malformed cloud event envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The event does not carry the required fields of a lifecycle action.
    #[error("invalid lifecycle action: missing {0}")]
    InvalidLifecycleAction(&'static str),
}

impl Error {
    /// Whether the error only affects the one message it was raised for.
    #[must_use]
    pub const fn is_unknown_detail_type(&self) -> bool {
        matches!(self, Self::UnknownDetailType { .. })
    }
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
