//! Command-line interface.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Per-host supervisor for Heroku-style application releases.
#[derive(Debug, Parser)]
#[command(name = "hsup")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// App name, for release sources that do not carry one.
    #[arg(short = 'a', long)]
    pub app: Option<String>,

    /// Run as one-shot processes: no restarting.
    #[arg(long)]
    pub oneshot: bool,

    /// The first assigned number to process types, e.g. web.1.
    #[arg(long, default_value_t = 1)]
    pub start_number: u32,

    /// Concurrency number for `run`.
    #[arg(short = 'c', long)]
    pub concurrency: Option<u32>,

    /// Dyno driver (program that starts a program):
    /// simple, abspath or container.
    #[arg(short = 'd', long, default_value = "simple")]
    pub dynodriver: String,

    /// Serve the control API on this unix socket.
    #[arg(long)]
    pub control_socket: Option<PathBuf>,

    /// Forward supervised process output to this log sink.
    #[arg(long)]
    pub logplex_url: Option<String>,

    /// Bind a host path into containers, as host:guest.
    #[arg(long, value_parser = parse_bind)]
    pub bind: Vec<(String, String)>,

    /// State directory for the container backend.
    #[arg(long, default_value = "/var/lib/hsup")]
    pub work_dir: PathBuf,

    #[command(subcommand)]
    pub action: CliAction,
}

#[derive(Debug, Subcommand)]
pub enum CliAction {
    /// Supervise the release's formations.
    Start {
        /// Optional parallelism overrides, e.g. `web=2 worker=1`.
        forms: Vec<String>,
    },
    /// Run a one-shot ad-hoc process.
    Run {
        /// Program and arguments to execute.
        #[arg(required = true, trailing_var_arg = true)]
        argv: Vec<String>,
    },
    /// Prepare the release's environment without starting anything.
    Build,
}

impl Cli {
    /// The caller's host-to-guest binds as a map.
    #[must_use]
    pub fn binds(&self) -> BTreeMap<String, String> {
        self.bind.iter().cloned().collect()
    }
}

fn parse_bind(value: &str) -> Result<(String, String), String> {
    match value.split_once(':') {
        Some((host, guest)) if !host.is_empty() && !guest.is_empty() => {
            Ok((host.to_string(), guest.to_string()))
        }
        _ => Err(format!("expected host:guest, got {value:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_accepts_parallelism_overrides() {
        let cli = Cli::parse_from(["hsup", "-a", "myapp", "start", "web=2", "worker=1"]);
        assert_eq!(cli.app.as_deref(), Some("myapp"));
        match cli.action {
            CliAction::Start { forms } => {
                assert_eq!(forms, vec!["web=2".to_string(), "worker=1".to_string()]);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn run_requires_a_program() {
        assert!(Cli::try_parse_from(["hsup", "run"]).is_err());
        let cli = Cli::parse_from(["hsup", "--oneshot", "run", "bash", "-c", "date"]);
        assert!(cli.oneshot);
        match cli.action {
            CliAction::Run { argv } => {
                assert_eq!(argv, vec!["bash", "-c", "date"]);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn binds_parse_as_host_guest_pairs() {
        let cli = Cli::parse_from(["hsup", "--bind", "/var/run:/run/outer", "build"]);
        assert_eq!(
            cli.binds().get("/var/run").map(String::as_str),
            Some("/run/outer")
        );

        assert!(Cli::try_parse_from(["hsup", "--bind", "nonsense", "build"]).is_err());
    }

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["hsup", "start"]);
        assert_eq!(cli.start_number, 1);
        assert_eq!(cli.dynodriver, "simple");
        assert_eq!(cli.work_dir, PathBuf::from("/var/lib/hsup"));
        assert!(cli.concurrency.is_none());
    }
}
