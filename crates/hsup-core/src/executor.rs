//! The per-dyno lifecycle state machine.
//!
//! Every executor is driven by exactly one task; state transitions happen
//! only from within that task's [`Executor::tick`] calls, while external
//! code (the supervisor, the control API, wait tasks) merely enqueues
//! inputs via [`Executor::trigger`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hsup_diag::diag;

use crate::driver::{DynoDriver, ExitStatus};
use crate::error::{Error, Result};
use crate::release::Release;

/// Lifecycle state of one dyno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DynoState {
    Stopped = 0,
    Started = 1,
    Retiring = 2,
    Retired = 3,
}

impl DynoState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Stopped,
            1 => Self::Started,
            2 => Self::Retiring,
            3 => Self::Retired,
            other => panic!("invalid dyno state encoding {other}"),
        }
    }
}

impl std::fmt::Display for DynoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Started => write!(f, "Started"),
            Self::Retiring => write!(f, "Retiring"),
            Self::Retired => write!(f, "Retired"),
        }
    }
}

/// Inputs accepted by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynoInput {
    Retire,
    Restart,
    Exited,
    StayStarted,
}

/// Handles populated by drivers on start and consumed on wait/stop.
#[derive(Default)]
pub struct DriverSlots {
    /// The spawned child, taken exactly once by the driver's wait.
    pub child: Option<tokio::process::Child>,
    /// Process-group leader (simple/abspath) or container init pid.
    pub child_pid: Option<i32>,
    /// Signalled once the driver's wait has reaped the child.
    pub waited: Option<watch::Sender<bool>>,
    /// Log relay owning the child's stdout/stderr pumps.
    pub relay: Option<hsup_logs::Relay>,
    /// Container backend handle.
    pub container: Option<ContainerSlot>,
    /// Init exit status, published by the container's terminal-wait task.
    pub init_exit: Option<mpsc::Receiver<ExitStatus>>,
    /// Address reported through the control API.
    pub ip_address: Option<String>,
    /// Port reported through the control API.
    pub port: Option<u16>,
}

/// Container resources attributed to an executor.
#[derive(Debug, Clone)]
pub struct ContainerSlot {
    pub uuid: String,
    pub uid: u32,
    pub data_dir: PathBuf,
}

/// Static description of one executor, supplied by the supervisor.
#[derive(Debug, Clone)]
pub struct ExecutorSpec {
    pub args: Vec<String>,
    pub process_type: String,
    pub process_id: u32,
    pub one_shot: bool,
    pub logplex_url: Option<String>,
    pub binds: BTreeMap<String, String>,
}

/// The per-dyno runtime entity.
pub struct Executor {
    pub args: Vec<String>,
    pub process_type: String,
    pub process_id: u32,
    pub one_shot: bool,
    pub logplex_url: Option<String>,
    pub binds: BTreeMap<String, String>,
    pub driver: Arc<dyn DynoDriver>,
    pub release: Arc<Release>,

    /// One-shot exit propagation to the supervisor.
    status: Option<mpsc::Sender<ExitStatus>>,

    /// Written only by the drive task; read as a stale snapshot elsewhere.
    state: AtomicU8,
    input_tx: mpsc::Sender<DynoInput>,
    input_rx: tokio::sync::Mutex<mpsc::Receiver<DynoInput>>,
    complete: CancellationToken,

    /// Back-reference for handing clones to spawned tasks.
    myself: Weak<Executor>,

    /// Driver-populated handles.
    pub slots: Mutex<DriverSlots>,
}

impl Executor {
    /// Creates an executor in the `Stopped` state. For one-shot executors
    /// the returned receiver yields the final exit status.
    pub fn create(
        spec: ExecutorSpec,
        driver: Arc<dyn DynoDriver>,
        release: Arc<Release>,
    ) -> (Arc<Self>, Option<mpsc::Receiver<ExitStatus>>) {
        let (input_tx, input_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = if spec.one_shot {
            let (tx, rx) = mpsc::channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let input_rx = tokio::sync::Mutex::new(input_rx);
        let ex = Arc::new_cyclic(|myself| Self {
            args: spec.args,
            process_type: spec.process_type,
            process_id: spec.process_id,
            one_shot: spec.one_shot,
            logplex_url: spec.logplex_url,
            binds: spec.binds,
            driver,
            release,
            status: status_tx,
            state: AtomicU8::new(DynoState::Stopped as u8),
            input_tx,
            input_rx,
            complete: CancellationToken::new(),
            myself: myself.clone(),
            slots: Mutex::new(DriverSlots::default()),
        });
        (ex, status_rx)
    }

    /// A strong handle to this executor for spawned tasks and drivers.
    fn arc(&self) -> Arc<Self> {
        self.myself
            .upgrade()
            .expect("executor methods are only reachable through an Arc")
    }

    /// The dyno name, e.g. `web.1`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}.{}", self.process_type, self.process_id)
    }

    /// Current state as a possibly-stale snapshot.
    #[must_use]
    pub fn state(&self) -> DynoState {
        DynoState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: DynoState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Resolves once the executor has retired and closed out.
    pub async fn completed(&self) {
        self.complete.cancelled().await;
    }

    /// Enqueues an input for the drive task.
    ///
    /// When the executor has already completed on its own the send side of
    /// the rendezvous would never be read again; racing the enqueue against
    /// completion guarantees callers (notably the control API's `Retire`
    /// injection) never block.
    pub async fn trigger(&self, input: DynoInput) {
        diag!("executor {} trigger {:?}", self.name(), input);
        tokio::select! {
            _ = self.input_tx.send(input) => {}
            () = self.complete.cancelled() => {}
        }
    }

    /// Runs the executor until it retires: fires the initial `StayStarted`,
    /// then ticks the state machine to completion.
    pub async fn drive(&self) {
        let starter = self.arc();
        tokio::spawn(async move {
            starter.trigger(DynoInput::StayStarted).await;
        });

        info!("beginning tick loop for {}", self.name());
        loop {
            match self.tick().await {
                Ok(()) => {}
                Err(Error::ExecutorComplete) => break,
                Err(e) => warn!("{}: tick error: {e}", self.name()),
            }
        }
        info!("executor completes {}", self.name());
    }

    /// Receives one input and advances the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutorComplete`] once the terminal state is
    /// reached; other errors come from the driver and leave the loop
    /// running.
    ///
    /// # Panics
    ///
    /// Panics on state/input combinations the table marks invalid; these
    /// document invariants and indicate supervisor bugs, not runtime
    /// conditions.
    pub async fn tick(&self) -> Result<()> {
        diag!(
            "executor {} waiting for tick (current state {})",
            self.name(),
            self.state()
        );
        let input = {
            let mut rx = self.input_rx.lock().await;
            rx.recv().await
        };
        let Some(input) = input else {
            // All senders gone; nothing can ever arrive again.
            return Err(Error::ExecutorComplete);
        };
        diag!("executor {} ticking with input {:?}", self.name(), input);

        loop {
            match self.state() {
                DynoState::Retired => {
                    self.complete.cancel();
                    return Err(Error::ExecutorComplete);
                }
                DynoState::Retiring => match input {
                    DynoInput::Exited => {
                        self.set_state(DynoState::Retired);
                        continue;
                    }
                    DynoInput::Retire => return self.driver.stop(&self.arc()).await,
                    DynoInput::Restart | DynoInput::StayStarted => return Ok(()),
                },
                DynoState::Stopped => match input {
                    DynoInput::Retire => {
                        self.set_state(DynoState::Retired);
                        continue;
                    }
                    DynoInput::Exited => {
                        if self.one_shot {
                            self.set_state(DynoState::Retired);
                            continue;
                        }
                        return self.start_dyno().await;
                    }
                    DynoInput::StayStarted | DynoInput::Restart => {
                        return self.start_dyno().await;
                    }
                },
                DynoState::Started => match input {
                    DynoInput::Retire => {
                        self.set_state(DynoState::Retiring);
                        continue;
                    }
                    DynoInput::Exited => {
                        self.set_state(DynoState::Stopped);
                        continue;
                    }
                    DynoInput::Restart => return self.driver.stop(&self.arc()).await,
                    DynoInput::StayStarted => {
                        panic!("invalid input StayStarted for started executor {}", self.name())
                    }
                },
            }
        }
    }

    /// Calls the driver's start, arranging restart-or-retire on failure and
    /// the wait task on success.
    async fn start_dyno(&self) -> Result<()> {
        info!("{}: starting", self.name());
        if let Err(e) = self.driver.start(&self.arc()).await {
            warn!("{}: start fails: {e}", self.name());
            let ex = self.arc();
            tokio::spawn(async move {
                if ex.one_shot {
                    ex.trigger(DynoInput::Retire).await;
                } else {
                    ex.trigger(DynoInput::Restart).await;
                }
            });
            return Err(e);
        }

        diag!("executor {} started", self.name());
        self.set_state(DynoState::Started);

        let ex = self.arc();
        tokio::spawn(async move {
            let status = ex.driver.wait(&ex).await;
            if let Some(tx) = &ex.status {
                info!("executor exits: {} exit code: {}", ex.name(), status.code);
                let _ = tx.send(status).await;
            }
            ex.trigger(DynoInput::Exited).await;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Driver whose processes "run" until stop is called, recording calls.
    struct ScriptedDriver {
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail_starts: bool,
        exit_code: i32,
        exited: tokio::sync::Notify,
    }

    impl ScriptedDriver {
        fn new() -> Self {
            Self {
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                fail_starts: false,
                exit_code: 0,
                exited: tokio::sync::Notify::new(),
            }
        }

        fn exiting_with(code: i32) -> Self {
            Self {
                exit_code: code,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl DynoDriver for ScriptedDriver {
        async fn build(&self, _release: &mut Release) -> Result<()> {
            Ok(())
        }

        async fn start(&self, _ex: &Arc<Executor>) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_starts {
                return Err(Error::Driver("scripted start failure".to_string()));
            }
            Ok(())
        }

        async fn wait(&self, _ex: &Arc<Executor>) -> ExitStatus {
            self.exited.notified().await;
            ExitStatus {
                code: self.exit_code,
                err: None,
            }
        }

        async fn stop(&self, _ex: &Arc<Executor>) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.exited.notify_waiters();
            Ok(())
        }
    }

    fn release() -> Arc<Release> {
        Arc::new(Release {
            app_name: "a".to_string(),
            version: 1,
            config: BTreeMap::new(),
            slug_url: "/tmp/s.tgz".to_string(),
            stack: "cedar-14".to_string(),
            image_name: None,
        })
    }

    fn spec(one_shot: bool) -> ExecutorSpec {
        ExecutorSpec {
            args: vec!["./w".to_string()],
            process_type: "web".to_string(),
            process_id: 1,
            one_shot,
            logplex_url: None,
            binds: BTreeMap::new(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn name_is_type_dot_ordinal() {
        let (ex, _) = Executor::create(spec(false), Arc::new(ScriptedDriver::new()), release());
        assert_eq!(ex.name(), "web.1");
    }

    #[tokio::test]
    async fn happy_path_reaches_retired_with_one_complete() {
        // StayStarted, Exited, Exited, Retire, Exited must produce
        // Started, Stopped->Started, Stopped->Started, Retiring, Retired.
        let driver = Arc::new(ScriptedDriver::new());
        let (ex, _) = Executor::create(spec(false), driver.clone() as Arc<dyn DynoDriver>, release());

        ex.trigger(DynoInput::StayStarted).await;
        ex.tick().await.unwrap();
        assert_eq!(ex.state(), DynoState::Started);

        for _ in 0..2 {
            ex.trigger(DynoInput::Exited).await;
            ex.tick().await.unwrap();
            assert_eq!(ex.state(), DynoState::Started);
        }
        assert_eq!(driver.starts.load(Ordering::SeqCst), 3);

        ex.trigger(DynoInput::Retire).await;
        ex.tick().await.unwrap();
        assert_eq!(ex.state(), DynoState::Retiring);
        assert_eq!(driver.stops.load(Ordering::SeqCst), 1);

        // stop() released the wait tasks, whose Exited drives retirement.
        let err = ex.tick().await.unwrap_err();
        assert!(matches!(err, Error::ExecutorComplete));
        assert_eq!(ex.state(), DynoState::Retired);

        // Complete fired exactly once; further ticks stay terminal.
        tokio::time::timeout(Duration::from_secs(1), ex.completed())
            .await
            .expect("complete should have fired");
    }

    #[tokio::test]
    async fn retired_is_absorbing() {
        let (ex, _) = Executor::create(spec(false), Arc::new(ScriptedDriver::new()), release());
        ex.trigger(DynoInput::Retire).await;
        assert!(matches!(
            ex.tick().await.unwrap_err(),
            Error::ExecutorComplete
        ));

        // Late inputs must not block even though nothing will read them.
        tokio::time::timeout(Duration::from_secs(1), ex.trigger(DynoInput::Retire))
            .await
            .expect("trigger after completion must not block");
        assert_eq!(ex.state(), DynoState::Retired);
        tokio::time::timeout(Duration::from_secs(1), ex.completed())
            .await
            .expect("completion is terminal");
    }

    #[tokio::test]
    async fn oneshot_exit_retires_and_propagates_status() {
        let driver = Arc::new(ScriptedDriver::exiting_with(7));
        let (ex, status_rx) =
            Executor::create(spec(true), driver.clone() as Arc<dyn DynoDriver>, release());
        let mut status_rx = status_rx.expect("one-shot executors report status");

        let drive_ex = Arc::clone(&ex);
        let drive = tokio::spawn(async move { drive_ex.drive().await });

        settle().await;
        assert_eq!(ex.state(), DynoState::Started);

        // Child exits 7: the wait task forwards the status, then the
        // executor retires instead of restarting.
        driver.exited.notify_waiters();
        let status = tokio::time::timeout(Duration::from_secs(1), status_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.code, 7);

        tokio::time::timeout(Duration::from_secs(1), drive)
            .await
            .expect("drive loop ends")
            .unwrap();
        assert_eq!(ex.state(), DynoState::Retired);
        assert_eq!(driver.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn crash_restarts_non_oneshot() {
        let driver = Arc::new(ScriptedDriver::new());
        let (ex, _) = Executor::create(spec(false), driver.clone() as Arc<dyn DynoDriver>, release());

        let drive_ex = Arc::clone(&ex);
        let _drive = tokio::spawn(async move { drive_ex.drive().await });
        settle().await;
        assert_eq!(driver.starts.load(Ordering::SeqCst), 1);

        // Crash: wait returns, Exited re-enters Stopped and starts again.
        driver.exited.notify_waiters();
        settle().await;
        assert_eq!(driver.starts.load(Ordering::SeqCst), 2);
        assert_eq!(ex.state(), DynoState::Started);

        ex.trigger(DynoInput::Retire).await;
        driver.exited.notify_waiters();
        settle().await;
        tokio::time::timeout(Duration::from_secs(1), ex.completed())
            .await
            .expect("executor retires");
    }

    #[tokio::test]
    async fn failed_start_of_oneshot_retires() {
        let driver = Arc::new(ScriptedDriver {
            fail_starts: true,
            ..ScriptedDriver::new()
        });
        let (ex, _) = Executor::create(spec(true), driver.clone() as Arc<dyn DynoDriver>, release());

        let drive_ex = Arc::clone(&ex);
        let drive = tokio::spawn(async move { drive_ex.drive().await });

        tokio::time::timeout(Duration::from_secs(1), drive)
            .await
            .expect("failed one-shot start retires the executor")
            .unwrap();
        assert_eq!(ex.state(), DynoState::Retired);
        assert_eq!(driver.starts.load(Ordering::SeqCst), 1);
    }
}
