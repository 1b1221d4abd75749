//! Error types shared by the store, the cleanup scheduler and the startup path.

use std::time::Duration;

/// Errors produced by the token store and its surroundings.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operation referenced a bucket that is not part of the configured set.
    #[error("Could not find bucket {0}")]
    UnknownBucket(String),

    /// Bucket definitions or server options failed validation at startup.
    #[error("{0}")]
    InvalidConfig(String),

    /// A cooperative sweep observed cancellation between two chunks.
    #[error("sweep of bucket {bucket} was cancelled")]
    SweepCancelled {
        /// Bucket being swept when cancellation was observed.
        bucket: String,
    },

    /// A scheduled sweep did not finish within its deadline.
    #[error("sweep did not finish within {0:?}")]
    SweepDeadline(Duration),

    /// The config file could not be parsed.
    #[error("could not parse config file: {0}")]
    ConfigFormat(String),

    /// I/O failure while reading config or binding the listener.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for building an [`Error::InvalidConfig`].
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Whether this error was caused by the caller rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::UnknownBucket(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
