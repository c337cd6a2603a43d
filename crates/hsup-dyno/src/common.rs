//! Child-process plumbing shared by the simple and abspath backends.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::watch;

use hsup_core::{Error, Executor, ExitStatus, Result};
use hsup_diag::diag;
use hsup_logs::Relay;

/// Grace window between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Wires a freshly spawned child into the executor's driver slots.
pub(crate) fn install_child(
    ex: &Arc<Executor>,
    child: tokio::process::Child,
    relay: Option<Relay>,
) -> Result<()> {
    let pid = child
        .id()
        .ok_or_else(|| Error::Driver("spawned child has no pid".to_string()))?;
    let (waited_tx, _) = watch::channel(false);

    let mut slots = ex.slots.lock().unwrap_or_else(|e| e.into_inner());
    slots.child = Some(child);
    slots.child_pid = Some(pid as i32);
    slots.waited = Some(waited_tx);
    slots.relay = relay;
    Ok(())
}

/// Reaps the child installed by [`install_child`]: waits for it, drains the
/// log relay so buffered logs are delivered, then releases anyone blocked
/// in [`stop_group`].
pub(crate) async fn reap_child(ex: &Arc<Executor>) -> ExitStatus {
    let (child, relay) = {
        let mut slots = ex.slots.lock().unwrap_or_else(|e| e.into_inner());
        (slots.child.take(), slots.relay.take())
    };

    let status = match child {
        Some(mut child) => match child.wait().await {
            Ok(status) => ExitStatus::from_process(status),
            // Errors out of wait are liable to be errors in starting the
            // process; propagate them.
            Err(e) => ExitStatus::failed_to_execute(e),
        },
        None => ExitStatus::failed_to_execute("child handle missing; wait called twice?"),
    };

    if let Some(relay) = relay {
        relay.stop().await;
    }

    let slots = ex.slots.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(waited) = &slots.waited {
        // send_replace stores the value even while no stop() is
        // subscribed yet.
        waited.send_replace(true);
    }

    status
}

/// Begins graceful shutdown of the child's whole process group via SIGTERM,
/// escalating to SIGKILL every grace period until the reaper reports the
/// child gone.
pub(crate) async fn stop_group(ex: &Arc<Executor>) -> Result<()> {
    let (pid, waited) = {
        let slots = ex.slots.lock().unwrap_or_else(|e| e.into_inner());
        (
            slots.child_pid,
            slots.waited.as_ref().map(watch::Sender::subscribe),
        )
    };
    let Some(pid) = pid else {
        // Never started; nothing to signal.
        return Ok(());
    };
    let group = Pid::from_raw(-pid);

    // The negated pid addresses the whole process group, so a single
    // signal reaches the child's entire subtree.
    let _ = kill(group, Signal::SIGTERM);

    let Some(mut waited) = waited else {
        return Ok(());
    };
    loop {
        tokio::select! {
            () = tokio::time::sleep(STOP_GRACE) => {
                diag!("sigkill {pid}");
                let _ = kill(group, Signal::SIGKILL);
            }
            result = waited.wait_for(|done| *done) => {
                diag!("waited {pid}");
                // A closed channel means the reaper is gone; either way the
                // child is no longer ours to signal.
                let _ = result;
                return Ok(());
            }
        }
    }
}

/// Attaches a log relay to a command when a sink is configured, switching
/// the child's stdout/stderr to pipes whose read ends the relay pumps.
pub(crate) fn start_relay(
    ex: &Arc<Executor>,
    child: &mut tokio::process::Child,
) -> Result<Option<Relay>> {
    let Some(url) = &ex.logplex_url else {
        return Ok(None);
    };

    let mut relay = Relay::new(url, &ex.name()).map_err(Error::driver)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Driver("child stdout was not piped".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Driver("child stderr was not piped".to_string()))?;
    relay.run_stdout(stdout);
    relay.run_stderr(stderr);
    Ok(Some(relay))
}
