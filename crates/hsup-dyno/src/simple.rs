//! The simple backend: run the dyno as a plain child of the supervisor.

use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;

use hsup_core::{DynoDriver, Error, Executor, ExitStatus, Release, Result};

use crate::common;

/// Runs dynos as direct children in their own process groups, with the
/// release environment and optional log forwarding. No filesystem isolation.
pub struct SimpleDriver;

#[async_trait]
impl DynoDriver for SimpleDriver {
    async fn build(&self, _release: &mut Release) -> Result<()> {
        Ok(())
    }

    async fn start(&self, ex: &Arc<Executor>) -> Result<()> {
        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg("-c").args(&ex.args);

        // The environment is exactly the release's configuration.
        cmd.env_clear();
        for (k, v) in &ex.release.config {
            cmd.env(k, v);
        }

        // A fresh process group lets one signal reach the whole subtree.
        cmd.process_group(0);

        if ex.logplex_url.is_some() {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(Error::from)?;
        let relay = common::start_relay(ex, &mut child)?;
        common::install_child(ex, child, relay)?;

        // Status-endpoint info is best-effort: a release without a
        // parseable PORT simply reports no address.
        if let Some(port) = ex.release.config.get("PORT").and_then(|p| p.parse().ok()) {
            let mut slots = ex.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.port = Some(port);
            slots.ip_address = local_ipv4().map(|ip| ip.to_string());
        }

        Ok(())
    }

    async fn wait(&self, ex: &Arc<Executor>) -> ExitStatus {
        common::reap_child(ex).await
    }

    async fn stop(&self, ex: &Arc<Executor>) -> Result<()> {
        common::stop_group(ex).await
    }
}

/// First non-loopback IPv4 address of this host, if any.
fn local_ipv4() -> Option<IpAddr> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifaddr in addrs {
        let Some(storage) = ifaddr.address else {
            continue;
        };
        let Some(sin) = storage.as_sockaddr_in() else {
            continue;
        };
        let ip = sin.ip();
        if !ip.is_loopback() {
            return Some(IpAddr::V4(ip));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsup_core::{DynoInput, DynoState, ExecutorSpec};
    use std::collections::BTreeMap;

    fn executor(args: Vec<&str>, env: &[(&str, &str)]) -> Arc<Executor> {
        let release = Arc::new(Release {
            app_name: "a".to_string(),
            version: 1,
            config: env
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            slug_url: "/tmp/s.tgz".to_string(),
            stack: "cedar-14".to_string(),
            image_name: None,
        });
        let (ex, _) = Executor::create(
            ExecutorSpec {
                args: args.into_iter().map(str::to_string).collect(),
                process_type: "web".to_string(),
                process_id: 1,
                one_shot: false,
                logplex_url: None,
                binds: BTreeMap::new(),
            },
            Arc::new(SimpleDriver),
            release,
        );
        ex
    }

    #[tokio::test]
    async fn runs_command_and_reports_exit_code() {
        let ex = executor(vec!["exit 42"], &[]);
        SimpleDriver.start(&ex).await.unwrap();
        let status = SimpleDriver.wait(&ex).await;
        assert_eq!(status.code, 42);
        assert!(status.err.is_none());
    }

    #[tokio::test]
    async fn environment_comes_from_the_release() {
        let ex = executor(vec!["exit $((GREETING + 1))"], &[("GREETING", "6")]);
        SimpleDriver.start(&ex).await.unwrap();
        assert_eq!(SimpleDriver.wait(&ex).await.code, 7);
    }

    #[tokio::test]
    async fn signal_death_reports_128_plus_signal() {
        let ex = executor(vec!["kill -TERM $$"], &[]);
        SimpleDriver.start(&ex).await.unwrap();
        let status = SimpleDriver.wait(&ex).await;
        assert_eq!(status.code, 128 + 15);
    }

    #[tokio::test]
    async fn stop_terminates_the_process_group() {
        let ex = executor(vec!["sleep 600"], &[]);
        SimpleDriver.start(&ex).await.unwrap();

        let waiter = Arc::clone(&ex);
        let wait_task = tokio::spawn(async move { SimpleDriver.wait(&waiter).await });

        tokio::time::timeout(std::time::Duration::from_secs(5), SimpleDriver.stop(&ex))
            .await
            .expect("stop should return once the child is reaped")
            .unwrap();

        let status = wait_task.await.unwrap();
        assert_eq!(status.code, 128 + 15);
    }

    #[tokio::test]
    async fn port_is_reported_when_parseable() {
        let ex = executor(vec!["true"], &[("PORT", "6000")]);
        SimpleDriver.start(&ex).await.unwrap();
        {
            let slots = ex.slots.lock().unwrap();
            assert_eq!(slots.port, Some(6000));
        }
        let _ = SimpleDriver.wait(&ex).await;
        assert_eq!(ex.state(), DynoState::Stopped);
        // The executor was never driven; state stays untouched by drivers.
        ex.trigger(DynoInput::Retire).await;
    }
}
