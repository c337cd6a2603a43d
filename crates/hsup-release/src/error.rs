//! Release-source error types.

use thiserror::Error;

/// Errors from control-directory manipulation.
///
/// Bad submissions are NOT errors; they are rejected in place. Errors
/// here are signs of serious conditions preventing database manipulation,
/// like a full disk.
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Error reporting itself failed; both causes are preserved because
    /// such cases are signs things have seriously gone wrong.
    #[error("{error} (while handling: {nested})")]
    Nested {
        error: Box<ReleaseError>,
        nested: String,
    },
}

/// Result alias for release-source operations.
pub type Result<T> = std::result::Result<T, ReleaseError>;
