//! The dyno driver contract.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::executor::Executor;
use crate::release::Release;

/// Terminal status of one dyno process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitStatus {
    /// Process exit code, or `128 + signal` when killed by a signal.
    pub code: i32,
    /// Set only for start-level failures propagated late.
    pub err: Option<String>,
}

impl ExitStatus {
    /// Derives the dyno exit status from an OS process status.
    #[must_use]
    pub fn from_process(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        let code = match (status.code(), status.signal()) {
            (_, Some(signal)) => 128 + signal,
            (Some(code), None) => code,
            (None, None) => 0,
        };
        Self { code, err: None }
    }

    /// A status representing a failure to execute the process at all.
    #[must_use]
    pub fn failed_to_execute(err: impl std::fmt::Display) -> Self {
        Self {
            code: 0,
            err: Some(err.to_string()),
        }
    }
}

/// Four-operation contract implemented by every execution backend.
///
/// Backends abstract "how to run one dyno": as a plain child process, inside
/// a fixed filesystem root, or inside a namespaced container.
#[async_trait]
pub trait DynoDriver: Send + Sync {
    /// Idempotent preparation for a release: download the slug to a local
    /// path (rewriting the release's slug locator), or ensure the stack
    /// image is mounted. May be skipped when the caller advertises a
    /// pre-built environment.
    async fn build(&self, release: &mut Release) -> Result<()>;

    /// Launches the process, returning once it is running or startup has
    /// definitely failed. Must populate the executor's driver slots.
    async fn start(&self, ex: &Arc<Executor>) -> Result<()>;

    /// Blocks until the process exits. Callable exactly once per start.
    async fn wait(&self, ex: &Arc<Executor>) -> ExitStatus;

    /// Begins graceful shutdown; the driver is responsible for escalating
    /// to forceful termination after the 10-second grace window.
    async fn stop(&self, ex: &Arc<Executor>) -> Result<()>;
}
