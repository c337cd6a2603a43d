//! Supervisor core error types.

use thiserror::Error;

/// Errors surfaced by the executor state machine and dyno drivers.
#[derive(Debug, Error)]
pub enum Error {
    /// The executor reached its terminal state; its drive loop must stop.
    #[error("executor complete")]
    ExecutorComplete,

    /// A release had no slug locator where one was required.
    #[error("no slug specified")]
    NoSlug,

    /// A backend operation failed.
    #[error("{0}")]
    Driver(String),

    /// A startup payload could not be decoded.
    #[error("invalid startup payload: {0}")]
    Payload(String),

    /// A concurrency specification could not be parsed.
    #[error("could not parse parallelism specification: {0}")]
    Concurrency(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps any backend failure as a driver error.
    pub fn driver(e: impl std::fmt::Display) -> Self {
        Self::Driver(e.to_string())
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
