//! Process-level dyno backends.
//!
//! Two of the execution backends live here: [`SimpleDriver`], which runs
//! the dyno as a plain supervised child, and [`AbsPathDriver`], which first
//! unpacks the release into a fixed filesystem root. The container backend
//! builds on the latter by re-exec'ing the supervisor around it.

mod abspath;
mod common;
mod profile;
mod simple;

pub use abspath::AbsPathDriver;
pub use profile::ProfileRunner;
pub use simple::SimpleDriver;
