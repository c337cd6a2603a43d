//! The supervisor's main select loop.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use hsup_core::{Action, DriverKind, DynoDriver, ExitStatus, Processes, Startup};

/// Everything one supervision session needs.
pub struct Supervisor {
    pub procs_rx: mpsc::Receiver<Arc<Processes>>,
    pub action: Action,
    pub action_args: Vec<String>,
    pub concurrency: Option<u32>,
    pub start_number: u32,
}

impl Supervisor {
    /// Runs until a deadly signal or, for one-shot generations, until
    /// every executor has reported. Returns the process exit code.
    ///
    /// # Errors
    ///
    /// Fails when a generation cannot be started.
    pub async fn run(mut self) -> Result<i32> {
        let mut sigint = signal(SignalKind::interrupt()).context("installing INT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("installing TERM handler")?;

        let mut current: Option<Arc<Processes>> = None;
        let mut statuses: Option<oneshot::Receiver<Vec<(String, ExitStatus)>>> = None;
        let mut source_open = true;

        loop {
            tokio::select! {
                maybe_procs = self.procs_rx.recv(), if source_open => {
                    match maybe_procs {
                        Some(procs) => {
                            if let Some(old) = current.take() {
                                old.stop_parallel().await;
                            }
                            procs
                                .start(
                                    self.action,
                                    &self.action_args,
                                    self.concurrency,
                                    self.start_number,
                                )
                                .await
                                .context("could not start process")?;
                            statuses = procs.statuses();
                            current = Some(procs);
                        }
                        None => {
                            // One-generation sources (the startup blob)
                            // close after their only delivery.
                            source_open = false;
                        }
                    }
                }

                collected = async { statuses.as_mut().expect("guarded by if").await },
                    if statuses.is_some() =>
                {
                    let collected = collected.unwrap_or_default();
                    return Ok(exit_code_for(&collected));
                }

                _ = sigint.recv() => return Ok(self.die("INT", current).await),
                _ = sigterm.recv() => return Ok(self.die("TERM", current).await),
            }
        }
    }

    /// Signal-driven shutdown: parallel retire, diagnostic dump, exit 1.
    async fn die(&self, signal: &str, current: Option<Arc<Processes>>) -> i32 {
        warn!("caught a deadly signal: SIG{signal}");
        for record in hsup_diag::contents() {
            eprintln!("diag: {record}");
        }
        if let Some(procs) = current {
            procs.stop_parallel().await;
        }
        1
    }
}

/// One-shot exit policy: 255 for anything that could not execute at all,
/// otherwise the maximum child exit code.
fn exit_code_for(statuses: &[(String, ExitStatus)]) -> i32 {
    let mut exit_val = 0;
    for (name, status) in statuses {
        if let Some(err) = &status.err {
            error!("could not execute {name}: {err}");
            exit_val = exit_val.max(255);
        } else {
            info!("{name} exits with code: {}", status.code);
            exit_val = exit_val.max(status.code);
        }
    }
    exit_val
}

/// Builds the driver named by a startup blob.
pub fn driver_for_kind(kind: &DriverKind, work_dir: &Path) -> Result<Arc<dyn DynoDriver>> {
    match kind {
        DriverKind::Simple => Ok(Arc::new(hsup_dyno::SimpleDriver)),
        DriverKind::AbsPath => Ok(Arc::new(hsup_dyno::AbsPathDriver)),
        DriverKind::Container => Ok(Arc::new(
            hsup_container::ContainerDriver::new(work_dir)
                .context("could not initiate container driver")?,
        )),
        DriverKind::ContainerInit(_) => {
            anyhow::bail!("container init must be handled before the runtime starts")
        }
    }
}

/// A release source that delivers exactly one generation, decoded from the
/// startup blob of a self-invocation.
pub fn blob_notifier(startup: &Startup, driver: Arc<dyn DynoDriver>) -> mpsc::Receiver<Arc<Processes>> {
    let (tx, rx) = mpsc::channel(1);
    let procs = Arc::new(startup.procs(driver));
    tokio::spawn(async move {
        let _ = tx.send(procs).await;
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: i32, err: Option<&str>) -> ExitStatus {
        ExitStatus {
            code,
            err: err.map(str::to_string),
        }
    }

    #[test]
    fn exit_code_is_the_maximum() {
        let statuses = vec![
            ("web.1".to_string(), status(0, None)),
            ("web.2".to_string(), status(7, None)),
            ("worker.1".to_string(), status(3, None)),
        ];
        assert_eq!(exit_code_for(&statuses), 7);
    }

    #[test]
    fn exec_failures_dominate() {
        let statuses = vec![
            ("web.1".to_string(), status(7, None)),
            ("web.2".to_string(), status(0, Some("no such file"))),
        ];
        assert_eq!(exit_code_for(&statuses), 255);
    }

    #[test]
    fn empty_generation_exits_zero() {
        assert_eq!(exit_code_for(&[]), 0);
    }
}
