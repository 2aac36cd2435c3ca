use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Elasticsearch could not be reached (after connection retries, if any
    /// were configured).
    #[error("elasticsearch unavailable: {0}")]
    Unavailable(#[source] Arc<reqwest::Error>),

    /// Elasticsearch replied with a non-success status code.
    #[error("elasticsearch returned {status} for {path}")]
    Status {
        /// The HTTP status code.
        status: u16,
        /// The request path.
        path: String,
    },

    /// A response body did not have the expected shape.
    #[error("unexpected elasticsearch response for {path}: {source}")]
    UnexpectedResponse {
        /// The request path.
        path: String,
        /// The decode failure.
        #[source]
        source: serde_json::Error,
    },
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Self::Unavailable(Arc::new(error))
    }
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
