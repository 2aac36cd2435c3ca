use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The lifecycle action expired, or no action with the given token
    /// exists (the provider cannot distinguish the two).
    #[error("lifecycle action timed out")]
    ActionTimedOut,

    /// Postponing was cancelled, normally because the node reached a
    /// terminal state and the caller no longer needs the hook held open.
    #[error("postponing cancelled")]
    Cancelled,

    /// The lifecycle hook could not be found.
    #[error("lifecycle hook {group}:{hook} not found")]
    HookNotFound {
        /// The AutoScaling Group name.
        group: String,
        /// The lifecycle hook name.
        hook: String,
    },

    /// An AutoScaling call failed.
    #[error("{0}")]
    AutoScaling(#[from] Box<aws_sdk_autoscaling::Error>),
}

impl Error {
    /// Whether this is the action-timed-out sentinel.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::ActionTimedOut)
    }

    /// Whether this is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
