//! The absolute-path backend: unpack the release into a fixed root and run
//! the command from there.
//!
//! This is the backend re-exec'd as the workload stage inside containers,
//! where `/app` and `/tmp` are the container's own writable mounts.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use hsup_core::{DynoDriver, Error, Executor, ExitStatus, Release, Result, SlugWhere};

use crate::common;
use crate::profile::ProfileRunner;

/// Filesystem root the slug unpacks into.
const APP_ROOT: &str = "/app";

/// Local path slugs are downloaded to before unpacking.
const SLUG_PATH: &str = "/tmp/slug.tgz";

/// Baseline PATH for app processes.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Runs dynos out of `/app` after unpacking the release slug there.
pub struct AbsPathDriver;

impl AbsPathDriver {
    /// Downloads a remote slug to the fixed local path, rewriting the
    /// release's locator.
    async fn fetch(&self, release: &mut Release) -> Result<()> {
        if release.slug_url.is_empty() {
            return Err(Error::NoSlug);
        }

        match release.slug_where() {
            SlugWhere::Local => {
                // The slug is already available on the filesystem.
            }
            SlugWhere::Http => {
                info!("fetching slug URL {:?}", release.slug_url);
                let resp = reqwest::get(&release.slug_url)
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .map_err(Error::driver)?;
                let body = resp.bytes().await.map_err(Error::driver)?;
                tokio::fs::write(SLUG_PATH, &body).await?;
                release.slug_url = SLUG_PATH.to_string();
            }
        }

        Ok(())
    }

    /// Unpacks the (local) slug into the app root, stripping the two
    /// leading path components of the archive layout.
    async fn unpack(&self, release: &Release) -> Result<()> {
        if release.slug_url.is_empty() {
            return Ok(());
        }
        assert!(
            release.slug_where() == SlugWhere::Local,
            "by unpack, the slug locator must have been rewritten to a local path"
        );

        let status = tokio::process::Command::new("/bin/tar")
            .args(["-C", APP_ROOT, "--strip-components=2", "-zxf"])
            .arg(&release.slug_url)
            .status()
            .await?;
        if !status.success() {
            return Err(Error::Driver(format!(
                "tar failed unpacking {}: {status}",
                release.slug_url
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl DynoDriver for AbsPathDriver {
    async fn build(&self, release: &mut Release) -> Result<()> {
        if release.slug_where() == SlugWhere::Http {
            self.fetch(release).await?;
        }
        self.unpack(release).await
    }

    async fn start(&self, ex: &Arc<Executor>) -> Result<()> {
        let pr = ProfileRunner::materialize()?;
        let argv = pr.argv(&ex.args);

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.current_dir(APP_ROOT);

        // Fixed baseline, overlaid with the release configuration.
        cmd.env_clear();
        cmd.env("PATH", DEFAULT_PATH);
        cmd.env("HOME", APP_ROOT);
        cmd.env("DYNO", ex.name());
        cmd.env("PORT", "5000");
        for (k, v) in &ex.release.config {
            cmd.env(k, v);
        }

        cmd.process_group(0);

        if ex.logplex_url.is_some() {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(Error::from)?;
        let relay = common::start_relay(ex, &mut child)?;
        common::install_child(ex, child, relay)
    }

    async fn wait(&self, ex: &Arc<Executor>) -> ExitStatus {
        common::reap_child(ex).await
    }

    async fn stop(&self, ex: &Arc<Executor>) -> Result<()> {
        common::stop_group(ex).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn release(slug: &str) -> Release {
        Release {
            app_name: "a".to_string(),
            version: 1,
            config: BTreeMap::new(),
            slug_url: slug.to_string(),
            stack: "cedar-14".to_string(),
            image_name: None,
        }
    }

    #[tokio::test]
    async fn build_requires_a_slug_for_remote_releases() {
        let mut rel = release("");
        // Empty slug short-circuits unpack; build succeeds as a no-op.
        AbsPathDriver.build(&mut rel).await.unwrap();
    }

    #[tokio::test]
    async fn fetch_rejects_empty_slug() {
        let mut rel = release("");
        assert!(matches!(
            AbsPathDriver.fetch(&mut rel).await,
            Err(Error::NoSlug)
        ));
    }

    #[tokio::test]
    async fn local_slugs_are_not_rewritten() {
        let mut rel = release("/var/tmp/slug.tgz");
        AbsPathDriver.fetch(&mut rel).await.unwrap();
        assert_eq!(rel.slug_url, "/var/tmp/slug.tgz");
    }
}
