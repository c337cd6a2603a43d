//! Generation-replacement behavior across the supervisor data path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use hsup_core::{
    Action, DynoDriver, DynoInput, DynoState, Executor, ExitStatus, Formation, Processes, Release,
    Result,
};

/// Driver whose dynos run until stopped, counting live processes.
struct GaugeDriver {
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl GaugeDriver {
    fn new() -> Self {
        Self {
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DynoDriver for GaugeDriver {
    async fn build(&self, _release: &mut Release) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _ex: &Arc<Executor>) -> Result<()> {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        Ok(())
    }

    async fn wait(&self, ex: &Arc<Executor>) -> ExitStatus {
        // Runs until stop() fires Exited through the state machine.
        ex.completed().await;
        ExitStatus::default()
    }

    async fn stop(&self, ex: &Arc<Executor>) -> Result<()> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        let ex = Arc::clone(ex);
        tokio::spawn(async move { ex.trigger(DynoInput::Exited).await });
        Ok(())
    }
}

fn release(version: u32) -> Release {
    Release {
        app_name: "a".to_string(),
        version,
        config: BTreeMap::new(),
        slug_url: "/tmp/s.tgz".to_string(),
        stack: "cedar-14".to_string(),
        image_name: None,
    }
}

fn web(quantity: u32) -> Vec<Formation> {
    vec![Formation {
        args: vec!["./w".to_string()],
        quantity,
        proc_type: "web".to_string(),
    }]
}

#[tokio::test]
async fn new_generation_starts_only_after_the_old_one_retired() {
    let driver = Arc::new(GaugeDriver::new());

    let first = Arc::new(Processes::new(
        release(1),
        web(2),
        driver.clone() as Arc<dyn DynoDriver>,
        false,
    ));
    first.start(Action::Start, &[], None, 1).await.unwrap();

    // Both dynos of generation 1 come up.
    for ex in first.executors() {
        wait_for(|| ex.state() == DynoState::Started).await;
    }
    assert_eq!(driver.live.load(Ordering::SeqCst), 2);

    // The supervisor's replacement protocol: join the old generation's
    // completion before starting the next.
    tokio::time::timeout(Duration::from_secs(5), first.stop_parallel())
        .await
        .expect("old generation retires");
    assert_eq!(driver.live.load(Ordering::SeqCst), 0);

    let second = Arc::new(Processes::new(
        release(2),
        web(2),
        driver.clone() as Arc<dyn DynoDriver>,
        false,
    ));
    second.start(Action::Start, &[], None, 1).await.unwrap();
    for ex in second.executors() {
        wait_for(|| ex.state() == DynoState::Started).await;
    }

    // Generations never overlapped.
    assert_eq!(driver.peak.load(Ordering::SeqCst), 2);
    assert_eq!(driver.live.load(Ordering::SeqCst), 2);

    second.stop_parallel().await;
}

#[tokio::test]
async fn retire_injection_after_self_completion_does_not_block() {
    let driver = Arc::new(GaugeDriver::new());
    let procs = Arc::new(Processes::new(
        release(1),
        web(1),
        driver as Arc<dyn DynoDriver>,
        false,
    ));
    procs.start(Action::Start, &[], None, 1).await.unwrap();

    procs.stop_parallel().await;
    let ex = procs.executors().into_iter().next().unwrap();
    assert_eq!(ex.state(), DynoState::Retired);

    // The control API's Retire injection races generation teardown; late
    // triggers must never hang the caller.
    tokio::time::timeout(Duration::from_secs(1), ex.trigger(DynoInput::Retire))
        .await
        .expect("late retire injection returns promptly");
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}
