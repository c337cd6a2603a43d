//! Network error types.

use thiserror::Error;

/// Network operation errors.
#[derive(Debug, Error)]
pub enum NetError {
    /// Netlink operation failed.
    #[error("netlink: {0}")]
    Netlink(String),

    /// iptables invocation failed.
    #[error("iptables {chain}: {output}")]
    Iptables { chain: String, output: String },

    /// A subnet did not have the expected /30 mask.
    #[error("mask is not a /30")]
    InvalidMask,

    /// Configuration value could not be parsed.
    #[error("invalid network configuration: {0}")]
    Config(String),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for network operations.
pub type Result<T> = std::result::Result<T, NetError>;
