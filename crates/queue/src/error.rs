use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The consumer has already been started.
    #[error("already started")]
    AlreadyStarted,

    /// An SQS call failed.
    #[error("{0}")]
    Sqs(#[from] aws_sdk_sqs::Error),

    /// An EC2 call failed.
    #[error("{0}")]
    Ec2(#[from] aws_sdk_ec2::Error),

    /// A delete-batch entry could not be built.
    #[error("bad delete batch entry: {0}")]
    DeleteEntry(String),
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
