//! Release sources.
//!
//! The supervisor learns about desired releases from a control directory
//! on disk; [`ControlDir`] implements the atomic ingestion protocol and
//! [`DirPoller`] turns accepted specs into generations on a channel.

pub mod control_dir;
pub mod error;
pub mod poller;

pub use control_dir::ControlDir;
pub use error::{ReleaseError, Result};
pub use poller::DirPoller;
