use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hsup_core::{Action, DriverKind, Startup, CONTROL_PAYLOAD_VAR};

mod cli;
mod supervise;

use cli::{Cli, CliAction};
use supervise::{blob_notifier, driver_for_kind, Supervisor};

/// Environment variable naming the release control directory.
const CONTROL_DIR_VAR: &str = "HSUP_CONTROL_DIR";

/// Environment escape hatch to skip the build step.
const SKIP_BUILD_VAR: &str = "HSUP_SKIP_BUILD";

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hsup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let payload = std::env::var(CONTROL_PAYLOAD_VAR).ok();
    let startup = payload
        .as_deref()
        .map(Startup::from_base64)
        .transpose()
        .context("decoding startup payload")?;

    // Container init never reaches the runtime: it finishes container
    // assembly on the main thread and execs the workload stage.
    if let Some(startup) = &startup {
        if let DriverKind::ContainerInit(config) = &startup.driver {
            let spec: hsup_container::ContainerSpec = serde_json::from_value(config.clone())
                .context("decoding container spec")?;
            hsup_container::init::run(&spec, startup).context("container init")?;
            unreachable!("container init either execs or errors");
        }
    }

    let exit = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?
        .block_on(run(startup))?;
    std::process::exit(exit);
}

async fn run(startup: Option<Startup>) -> Result<i32> {
    info!("starting hsup");

    // Self-invocations carry their whole configuration in the payload and
    // take no arguments.
    if let Some(startup) = startup {
        return run_from_blob(startup).await;
    }

    let cli = Cli::parse();
    let control_dir = std::env::var(CONTROL_DIR_VAR).ok();
    let Some(control_dir) = control_dir else {
        bail!("need {CONTROL_DIR_VAR}");
    };

    let driver_kind =
        DriverKind::from_flag(&cli.dynodriver).context("could not initiate dyno driver")?;
    let driver = driver_for_kind(&driver_kind, &cli.work_dir)?;

    let (action, action_args) = match &cli.action {
        CliAction::Start { forms } => (Action::Start, forms.clone()),
        CliAction::Run { argv } => (Action::Run, argv.clone()),
        CliAction::Build => (Action::Build, Vec::new()),
    };

    let poller = hsup_release::DirPoller {
        dir: control_dir.into(),
        app_name: cli.app.clone().unwrap_or_default(),
        driver,
        one_shot: cli.oneshot || !matches!(action, Action::Start),
        logplex_url: cli.logplex_url.clone(),
        binds: cli.binds(),
        skip_build: std::env::var(SKIP_BUILD_VAR).as_deref() == Ok("TRUE"),
    };
    let mut procs_rx = poller.notify();

    if let Some(socket) = &cli.control_socket {
        let api = Arc::new(hsup_api::ControlApi::new(socket));
        procs_rx = api.tee(procs_rx);
        tokio::spawn(async move {
            if let Err(e) = api.listen().await {
                warn!("control API unavailable: {e}");
            }
        });
    }

    Supervisor {
        procs_rx,
        action,
        action_args,
        concurrency: cli.concurrency,
        start_number: cli.start_number,
    }
    .run()
    .await
}

/// Runs a sub-invocation entirely from its startup payload.
async fn run_from_blob(mut startup: Startup) -> Result<i32> {
    if std::env::var(SKIP_BUILD_VAR).as_deref() == Ok("TRUE") {
        startup.skip_build = true;
    }

    let driver = driver_for_kind(&startup.driver, std::path::Path::new("/var/lib/hsup"))?;
    let procs_rx = blob_notifier(&startup, driver);

    let mut procs_rx = procs_rx;
    if let Some(socket) = &startup.control_socket {
        let api = Arc::new(hsup_api::ControlApi::new(socket));
        procs_rx = api.tee(procs_rx);
        tokio::spawn(async move {
            if let Err(e) = api.listen().await {
                warn!("control API unavailable: {e}");
            }
        });
    }

    Supervisor {
        procs_rx,
        action: startup.action,
        action_args: startup.args.clone(),
        concurrency: None,
        start_number: startup.start_number,
    }
    .run()
    .await
}
