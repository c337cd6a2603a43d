//! Generations of executors.
//!
//! A [`Processes`] value is the set of executors produced from one release.
//! The supervisor replaces the whole generation atomically when a new
//! release is accepted: the old generation is retired in parallel and
//! joined before the new one starts.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::driver::{DynoDriver, ExitStatus};
use crate::error::{Error, Result};
use crate::executor::{DynoInput, Executor, ExecutorSpec};
use crate::release::{Formation, Release};
use crate::serialization::Action;

/// Decides how many executors to run for a formation.
#[derive(Debug, Clone)]
pub enum ConcResolver {
    /// Realize each formation's declared quantity.
    Quantity,
    /// Explicit `type=count` overrides; unlisted types run zero.
    Explicit(HashMap<String, u32>),
}

impl ConcResolver {
    /// Parses fragments like `web=2`, `worker` (implying 1) into an
    /// explicit resolver.
    ///
    /// # Errors
    ///
    /// Returns an error when a count is not a valid integer.
    pub fn parse_explicit(args: &[String]) -> Result<Self> {
        let mut map = HashMap::new();
        for arg in args {
            match arg.split_once('=') {
                Some((name, count)) => {
                    let count: u32 = count
                        .parse()
                        .map_err(|_| Error::Concurrency(format!("not a valid integer: {arg:?}")))?;
                    map.insert(name.to_string(), count);
                }
                None => {
                    map.insert(arg.clone(), 1);
                }
            }
        }
        Ok(Self::Explicit(map))
    }

    /// Number of executors to run for `form`.
    #[must_use]
    pub fn resolve(&self, form: &Formation) -> u32 {
        match self {
            Self::Quantity => form.quantity,
            Self::Explicit(map) => map.get(&form.proc_type).copied().unwrap_or(0),
        }
    }
}

/// One generation: a release plus the executors realizing it.
pub struct Processes {
    release: RwLock<Arc<Release>>,
    pub formations: Vec<Formation>,
    pub driver: Arc<dyn DynoDriver>,
    one_shot: AtomicBool,
    pub skip_build: bool,
    pub logplex_url: Option<String>,
    pub binds: BTreeMap<String, String>,

    executors: RwLock<Vec<Arc<Executor>>>,
    status_rxs: Mutex<Vec<(String, mpsc::Receiver<ExitStatus>)>>,
}

impl Processes {
    /// Creates an idle generation; executors appear once
    /// [`Processes::start`] runs.
    #[must_use]
    pub fn new(
        release: Release,
        formations: Vec<Formation>,
        driver: Arc<dyn DynoDriver>,
        one_shot: bool,
    ) -> Self {
        Self {
            release: RwLock::new(Arc::new(release)),
            formations,
            driver,
            one_shot: AtomicBool::new(one_shot),
            skip_build: false,
            logplex_url: None,
            binds: BTreeMap::new(),
            executors: RwLock::new(Vec::new()),
            status_rxs: Mutex::new(Vec::new()),
        }
    }

    /// The generation's release (post-build once build has run).
    #[must_use]
    pub fn release(&self) -> Arc<Release> {
        Arc::clone(&self.release.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Whether this generation retires dynos instead of restarting them.
    #[must_use]
    pub fn one_shot(&self) -> bool {
        self.one_shot.load(Ordering::Acquire)
    }

    /// Snapshot of the generation's executors, in formation-declaration ×
    /// ordinal order.
    #[must_use]
    pub fn executors(&self) -> Vec<Arc<Executor>> {
        self.executors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Builds the release (unless skipped), instantiates executors for
    /// `action`, and spawns their drive loops.
    ///
    /// # Errors
    ///
    /// Fails when the driver cannot bake the release; no executor starts in
    /// that case.
    pub async fn start(
        &self,
        action: Action,
        args: &[String],
        concurrency: Option<u32>,
        start_number: u32,
    ) -> Result<()> {
        if !self.skip_build {
            let mut rel = (*self.release()).clone();
            if let Err(e) = self.driver.build(&mut rel).await {
                warn!("could not bake image for release {}: {e}", rel.name());
                return Err(e);
            }
            *self.release.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(rel);
        }

        match action {
            Action::Start => {
                let resolver = if args.is_empty() {
                    ConcResolver::Quantity
                } else {
                    ConcResolver::parse_explicit(args)?
                };
                for form in &self.formations {
                    let conc = resolver.resolve(form);
                    info!("formation quantity={conc} type={}", form.proc_type);
                    for i in 0..conc {
                        self.add_executor(ExecutorSpec {
                            args: form.args.clone(),
                            process_type: form.proc_type.clone(),
                            process_id: i + start_number,
                            one_shot: self.one_shot(),
                            logplex_url: self.logplex_url.clone(),
                            binds: self.binds.clone(),
                        });
                    }
                }
            }
            Action::Run => {
                self.one_shot.store(true, Ordering::Release);
                let conc = concurrency.unwrap_or(1);
                for i in 0..conc {
                    self.add_executor(ExecutorSpec {
                        args: args.to_vec(),
                        process_type: "run".to_string(),
                        process_id: i + start_number,
                        one_shot: true,
                        logplex_url: self.logplex_url.clone(),
                        binds: self.binds.clone(),
                    });
                }
            }
            Action::Build => {
                self.one_shot.store(true, Ordering::Release);
            }
        }

        self.start_parallel();
        Ok(())
    }

    fn add_executor(&self, spec: ExecutorSpec) {
        let (ex, status_rx) = Executor::create(spec, Arc::clone(&self.driver), self.release());
        if let Some(rx) = status_rx {
            self.status_rxs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((ex.name(), rx));
        }
        self.executors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(ex);
    }

    /// Spawns one independent drive task per executor.
    fn start_parallel(&self) {
        for ex in self.executors() {
            tokio::spawn(async move {
                ex.drive().await;
            });
        }
    }

    /// Retires every executor and joins on their completion. Dynos shut
    /// down slowly, so the fan-out is parallel.
    pub async fn stop_parallel(&self) {
        info!("stopping everything");

        let executors = self.executors();
        for ex in &executors {
            let ex = Arc::clone(ex);
            tokio::spawn(async move {
                ex.trigger(DynoInput::Retire).await;
            });
        }
        for ex in &executors {
            ex.completed().await;
        }
    }

    /// For one-shot generations, resolves with every executor's final exit
    /// status once all have reported. Returns `None` otherwise.
    pub fn statuses(&self) -> Option<oneshot::Receiver<Vec<(String, ExitStatus)>>> {
        if !self.one_shot() {
            return None;
        }

        let rxs: Vec<_> = std::mem::take(
            &mut *self.status_rxs.lock().unwrap_or_else(|e| e.into_inner()),
        );
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut out = Vec::with_capacity(rxs.len());
            for (name, mut status_rx) in rxs {
                if let Some(status) = status_rx.recv().await {
                    out.push((name, status));
                }
            }
            let _ = tx.send(out);
        });
        Some(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingDriver {
        builds: AtomicUsize,
        starts: AtomicUsize,
    }

    #[async_trait]
    impl DynoDriver for CountingDriver {
        async fn build(&self, _release: &mut Release) -> Result<()> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn start(&self, _ex: &Arc<Executor>) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn wait(&self, _ex: &Arc<Executor>) -> ExitStatus {
            // "Processes" run until retired.
            std::future::pending().await
        }

        async fn stop(&self, ex: &Arc<Executor>) -> Result<()> {
            let ex = Arc::clone(ex);
            tokio::spawn(async move { ex.trigger(DynoInput::Exited).await });
            Ok(())
        }
    }

    fn release() -> Release {
        Release {
            app_name: "a".to_string(),
            version: 1,
            config: BTreeMap::new(),
            slug_url: "/tmp/s.tgz".to_string(),
            stack: "cedar-14".to_string(),
            image_name: None,
        }
    }

    fn formations() -> Vec<Formation> {
        vec![
            Formation {
                args: vec!["./web".to_string()],
                quantity: 2,
                proc_type: "web".to_string(),
            },
            Formation {
                args: vec!["./worker".to_string()],
                quantity: 1,
                proc_type: "worker".to_string(),
            },
        ]
    }

    #[test]
    fn explicit_resolver_parses() {
        let resolver =
            ConcResolver::parse_explicit(&["web=2".to_string(), "worker".to_string()]).unwrap();
        let forms = formations();
        assert_eq!(resolver.resolve(&forms[0]), 2);
        assert_eq!(resolver.resolve(&forms[1]), 1);

        let other = Formation {
            args: vec![],
            quantity: 9,
            proc_type: "cron".to_string(),
        };
        assert_eq!(resolver.resolve(&other), 0);

        assert!(ConcResolver::parse_explicit(&["web=x".to_string()]).is_err());
    }

    #[test]
    fn quantity_resolver_honors_declared_scale() {
        let forms = formations();
        assert_eq!(ConcResolver::Quantity.resolve(&forms[0]), 2);
        assert_eq!(ConcResolver::Quantity.resolve(&forms[1]), 1);
    }

    #[tokio::test]
    async fn start_builds_once_and_orders_executors() {
        let driver = Arc::new(CountingDriver {
            builds: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
        });
        let procs = Arc::new(Processes::new(
            release(),
            formations(),
            driver.clone() as Arc<dyn DynoDriver>,
            false,
        ));

        procs.start(Action::Start, &[], None, 1).await.unwrap();

        // Build happens once per generation, not per executor.
        assert_eq!(driver.builds.load(Ordering::SeqCst), 1);

        // Declaration order of formations × ordinal 1..quantity.
        let names: Vec<String> = procs.executors().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["web.1", "web.2", "worker.1"]);

        procs.stop_parallel().await;
    }

    #[tokio::test]
    async fn stop_parallel_joins_all_executors() {
        let driver = Arc::new(CountingDriver {
            builds: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
        });
        let procs = Arc::new(Processes::new(
            release(),
            formations(),
            driver as Arc<dyn DynoDriver>,
            false,
        ));
        procs.start(Action::Start, &[], None, 1).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), procs.stop_parallel())
            .await
            .expect("parallel stop completes");
        for ex in procs.executors() {
            assert_eq!(ex.state(), crate::executor::DynoState::Retired);
        }
    }

    #[tokio::test]
    async fn run_action_is_one_shot_with_run_type() {
        let driver = Arc::new(CountingDriver {
            builds: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
        });
        let procs = Arc::new(Processes::new(
            release(),
            Vec::new(),
            driver as Arc<dyn DynoDriver>,
            false,
        ));
        procs
            .start(Action::Run, &["./task".to_string()], None, 1)
            .await
            .unwrap();

        assert!(procs.one_shot());
        let executors = procs.executors();
        assert_eq!(executors.len(), 1);
        assert_eq!(executors[0].name(), "run.1");
        assert!(procs.statuses().is_some());

        procs.stop_parallel().await;
    }
}
