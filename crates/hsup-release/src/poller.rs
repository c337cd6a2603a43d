//! The directory poller: a release source backed by a control directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use hsup_core::{AppSerializable, DynoDriver, Processes};

use crate::control_dir::ControlDir;

/// How often the control directory is inspected.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Polls a control directory and emits a fully-populated generation for
/// every accepted release.
pub struct DirPoller {
    pub dir: PathBuf,
    pub app_name: String,
    pub driver: Arc<dyn DynoDriver>,
    pub one_shot: bool,

    /// Overrides the release's log sink when set.
    pub logplex_url: Option<String>,
    /// Host-to-guest binds requested on the command line.
    pub binds: std::collections::BTreeMap<String, String>,
    /// Skip the driver build step for pre-built environments.
    pub skip_build: bool,
}

impl DirPoller {
    /// Starts the poll loop; each accepted spec arrives on the returned
    /// channel as a new generation.
    #[must_use]
    pub fn notify(self) -> mpsc::Receiver<Arc<Processes>> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(self.poll_loop(tx));
        rx
    }

    async fn poll_loop(self, tx: mpsc::Sender<Arc<Processes>>) {
        let mut control: ControlDir<AppSerializable> = ControlDir::new(&self.dir);
        loop {
            match control.poll() {
                Ok(true) => {
                    if let Some(app) = control.snapshot() {
                        let mut procs =
                            app.procs(&self.app_name, Arc::clone(&self.driver), self.one_shot);
                        if self.logplex_url.is_some() {
                            procs.logplex_url = self.logplex_url.clone();
                        }
                        procs.binds = self.binds.clone();
                        procs.skip_build = self.skip_build;
                        if tx.send(Arc::new(procs)).await.is_err() {
                            return; // supervisor gone
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("could not fetch new release information: {e}"),
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hsup_core::{Executor, ExitStatus, Release};

    struct NullDriver;

    #[async_trait]
    impl DynoDriver for NullDriver {
        async fn build(&self, _release: &mut Release) -> hsup_core::Result<()> {
            Ok(())
        }
        async fn start(&self, _ex: &Arc<Executor>) -> hsup_core::Result<()> {
            Ok(())
        }
        async fn wait(&self, _ex: &Arc<Executor>) -> ExitStatus {
            ExitStatus::default()
        }
        async fn stop(&self, _ex: &Arc<Executor>) -> hsup_core::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cold_start_yields_one_generation() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("loaded"),
            r#"{"Version":1,"Name":"a","Env":{"K":"V"},"Slug":"/tmp/s.tgz","Stack":"cedar-14","Processes":[{"Args":["./w"],"Quantity":1,"Type":"web"}]}"#,
        )
        .unwrap();

        let poller = DirPoller {
            dir: dir.path().to_path_buf(),
            app_name: String::new(),
            driver: Arc::new(NullDriver),
            one_shot: false,
            logplex_url: None,
            binds: Default::default(),
            skip_build: false,
        };
        let mut rx = poller.notify();

        let procs = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("first poll yields a generation")
            .unwrap();

        let release = procs.release();
        assert_eq!(release.app_name, "a");
        assert_eq!(release.version, 1);
        assert_eq!(release.config.get("K").map(String::as_str), Some("V"));
        assert_eq!(procs.formations.len(), 1);
        assert_eq!(procs.formations[0].proc_type, "web");
        assert_eq!(procs.formations[0].args, vec!["./w".to_string()]);
        assert_eq!(procs.formations[0].quantity, 1);
    }
}
