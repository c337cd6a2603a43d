//! Log relay error types.

use thiserror::Error;

/// Errors raised while setting up log forwarding.
#[derive(Debug, Error)]
pub enum LogsError {
    /// The configured sink URL is unusable.
    #[error("could not set up log channel: {0}")]
    BadSinkUrl(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for log relay operations.
pub type Result<T> = std::result::Result<T, LogsError>;
