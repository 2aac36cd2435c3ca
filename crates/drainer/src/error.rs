use thiserror::Error;

/// Errors that can occur in the drainer daemon.
#[derive(Debug, Error)]
pub enum Error {
    /// An Elasticsearch operation failed.
    #[error(transparent)]
    Es(#[from] esdrain_es::Error),

    /// A cloud event could not be handled.
    #[error(transparent)]
    Events(#[from] esdrain_events::Error),

    /// The queue consumer failed.
    #[error(transparent)]
    Queue(#[from] esdrain_queue::Error),

    /// A lifecycle operation failed.
    #[error(transparent)]
    Lifecycle(#[from] esdrain_lifecycle::Error),

    /// A metric could not be registered.
    #[error("{0}")]
    Metrics(#[from] prometheus::Error),

    /// The global tracing subscriber could not be installed.
    #[error("{0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    /// An I/O operation failed.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// A spawned task panicked or was aborted.
    #[error("{0}")]
    Join(#[from] tokio::task::JoinError),

    /// A bus subscription closed before the process was shut down.
    #[error("event listener closed")]
    ListenerClosed,

    /// A long-running subsystem exited without being asked to.
    #[error("{0} exited unexpectedly")]
    SubsystemExited(&'static str),

    /// A subsystem was started twice.
    #[error("{0} already started")]
    AlreadyStarted(&'static str),
}

impl Error {
    /// Whether the error applies to a single cloud event rather than the
    /// process. Event-level failures are logged and the loop continues.
    #[must_use]
    pub const fn is_event_level(&self) -> bool {
        matches!(
            self,
            Self::Events(esdrain_events::Error::InvalidLifecycleAction(_))
        )
    }
}

/// Result type for the drainer daemon.
pub type Result<T> = std::result::Result<T, Error>;
