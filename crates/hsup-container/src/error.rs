//! Container backend error types.

use thiserror::Error;

/// Errors raised while assembling or tearing down containers.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// No mounted stack image matched the release's stack.
    #[error("no matching stack image found for {0:?}")]
    NoStackImage(String),

    /// A mount operation failed.
    #[error("mount {target}: {source}")]
    Mount {
        target: String,
        source: nix::Error,
    },

    /// A system call failed during container setup.
    #[error("{op}: {source}")]
    Sys { op: String, source: nix::Error },

    /// In-container init could not complete.
    #[error("container init: {0}")]
    Init(String),

    #[error(transparent)]
    Alloc(#[from] hsup_allocator::AllocError),

    #[error(transparent)]
    Net(#[from] hsup_net::NetError),

    #[error("payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    pub(crate) fn mount(target: impl std::fmt::Display, source: nix::Error) -> Self {
        Self::Mount {
            target: target.to_string(),
            source,
        }
    }

    pub(crate) fn sys(op: impl Into<String>, source: nix::Error) -> Self {
        Self::Sys {
            op: op.into(),
            source,
        }
    }
}

/// Result alias for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;
