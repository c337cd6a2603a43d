//! Atomic ingestion of specs from a control directory.
//!
//! The directory holds four well-known files: `new` (submitted by an
//! external writer), `loaded` (the last accepted spec), and `rejected` +
//! `last_error` (the most recent bad submission and why). Acceptance is
//! crash-safe: contents are staged in a temp file, fsynced, renamed over
//! `loaded`, and the directory itself is fsynced before the submission is
//! removed. After any crash, `loaded` is either the previous spec or a
//! fully-written new one, never a partial write.

use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;

use crate::error::{ReleaseError, Result};

/// A typed control directory.
pub struct ControlDir<T> {
    path: PathBuf,
    snapshot: RwLock<Option<Arc<T>>>,

    /// Controls the semantics of the first poll, which may load `loaded`
    /// from a cold start.
    beyond_first_time: bool,

    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ControlDir<T> {
    /// Wraps the directory at `path`; nothing is read until the first
    /// poll.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: RwLock::new(None),
            beyond_first_time: false,
            _marker: PhantomData,
        }
    }

    fn loaded_path(&self) -> PathBuf {
        self.path.join("loaded")
    }

    fn new_path(&self) -> PathBuf {
        self.path.join("new")
    }

    fn rejected_path(&self) -> PathBuf {
        self.path.join("rejected")
    }

    fn error_path(&self) -> PathBuf {
        self.path.join("last_error")
    }

    /// The most recently accepted spec, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<T>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn publish(&self, snap: T) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(snap));
    }

    /// Cold-start: load `loaded` when it exists.
    fn poll_first_time(&self) -> Result<bool> {
        let contents = match std::fs::read(self.loaded_path()) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // No prior accepted spec: just a fresh database.
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let snap: T = serde_json::from_slice(&contents)?;
        self.publish(snap);
        Ok(true)
    }

    /// Checks for a submission, returning whether a new spec was
    /// published.
    ///
    /// A malformed submission is moved to `rejected` with its error in
    /// `last_error`; the poll itself still succeeds, since callers treat
    /// poll errors as serious conditions (out of disk and the like) rather
    /// than bad input.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory itself cannot be manipulated.
    pub fn poll(&mut self) -> Result<bool> {
        let mut new_info = false;
        if !self.beyond_first_time {
            new_info = self.poll_first_time()?;
            self.beyond_first_time = true;
        }

        let submit_path = self.new_path();
        let contents = match std::fs::read(&submit_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // The common branch: nothing submitted.
                return Ok(new_info);
            }
            Err(e) => return Err(e.into()),
        };

        // Validate before touching anything durable.
        let snap: T = match serde_json::from_slice(&contents) {
            Ok(snap) => snap,
            Err(parse_err) => {
                self.reject(&submit_path, &parse_err).map_err(|e| {
                    ReleaseError::Nested {
                        error: Box::new(e),
                        nested: parse_err.to_string(),
                    }
                })?;
                return Ok(new_info);
            }
        };

        // Reflect the accepted state on disk before installing it, so a
        // crash yields the new state rather than the old one.
        self.persist_loaded(&contents)?;

        // The diagnostics are advisory; their removal may fail freely.
        let _ = std::fs::remove_file(self.error_path());
        let _ = std::fs::remove_file(self.rejected_path());

        self.publish(snap);
        Ok(true)
    }

    /// Durably replaces `loaded` with the verified contents.
    fn persist_loaded(&self, contents: &[u8]) -> Result<()> {
        // A directory handle is needed to flush the renames.
        let dir = std::fs::File::open(&self.path)?;

        let mut tempf = tempfile::Builder::new()
            .prefix("tmp_")
            .tempfile_in(&self.path)?;
        tempf.write_all(contents)?;
        tempf.as_file().sync_all()?;

        // Visible immediately, durable after the directory flush.
        tempf
            .persist(self.loaded_path())
            .map_err(|e| ReleaseError::Io(e.error))?;
        dir.sync_all()?;

        // Purge the accepted submission, then make its removal durable.
        std::fs::remove_file(self.new_path())?;
        dir.sync_all()?;

        Ok(())
    }

    /// Moves a bad submission aside and records why it was rejected.
    fn reject(&self, submit_path: &Path, cause: &dyn std::fmt::Display) -> Result<()> {
        std::fs::rename(submit_path, self.rejected_path())?;

        // An incomplete error file after a crash is acceptable; don't
        // bother syncing it.
        let error_path = self.error_path();
        let _ = std::fs::remove_file(&error_path);
        std::fs::write(&error_path, format!("{cause}\n"))?;
        let mut perms = std::fs::metadata(&error_path)?.permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o400);
        std::fs::set_permissions(&error_path, perms)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Doc {
        #[serde(rename = "Version")]
        version: u32,
    }

    fn write(dir: &TempDir, name: &str, contents: &str) {
        std::fs::write(dir.path().join(name), contents).unwrap();
    }

    #[test]
    fn cold_start_loads_loaded() {
        let dir = TempDir::new().unwrap();
        write(&dir, "loaded", r#"{"Version": 1}"#);

        let mut control: ControlDir<Doc> = ControlDir::new(dir.path());
        assert!(control.poll().unwrap());
        assert_eq!(control.snapshot().unwrap().version, 1);

        // Only the first poll replays `loaded`.
        assert!(!control.poll().unwrap());
    }

    #[test]
    fn cold_start_without_loaded_is_quiet() {
        let dir = TempDir::new().unwrap();
        let mut control: ControlDir<Doc> = ControlDir::new(dir.path());
        assert!(!control.poll().unwrap());
        assert!(control.snapshot().is_none());
    }

    #[test]
    fn bad_submission_is_rejected_not_an_error() {
        let dir = TempDir::new().unwrap();
        write(&dir, "loaded", r#"{"Version": 1}"#);
        write(&dir, "new", "bogus json");

        let mut control: ControlDir<Doc> = ControlDir::new(dir.path());
        assert!(control.poll().unwrap());
        assert_eq!(control.snapshot().unwrap().version, 1);

        assert!(!dir.path().join("new").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("rejected")).unwrap(),
            "bogus json"
        );
        let last_error = std::fs::read_to_string(dir.path().join("last_error")).unwrap();
        assert!(!last_error.trim().is_empty());

        // The current snapshot is undisturbed.
        assert_eq!(control.snapshot().unwrap().version, 1);
    }

    #[test]
    fn good_submission_is_accepted_durably() {
        let dir = TempDir::new().unwrap();
        write(&dir, "loaded", r#"{"Version": 1}"#);
        write(&dir, "new", r#"{"Version": 2}"#);

        let mut control: ControlDir<Doc> = ControlDir::new(dir.path());
        assert!(control.poll().unwrap());
        assert_eq!(control.snapshot().unwrap().version, 2);

        assert!(!dir.path().join("new").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("loaded")).unwrap(),
            r#"{"Version": 2}"#
        );
        // No temp staging files linger.
        let stragglers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("tmp_"))
            .collect();
        assert!(stragglers.is_empty());
    }

    #[test]
    fn acceptance_clears_old_diagnostics() {
        let dir = TempDir::new().unwrap();
        write(&dir, "new", "not json at all");
        let mut control: ControlDir<Doc> = ControlDir::new(dir.path());
        assert!(!control.poll().unwrap());
        assert!(dir.path().join("rejected").exists());
        assert!(dir.path().join("last_error").exists());

        write(&dir, "new", r#"{"Version": 3}"#);
        assert!(control.poll().unwrap());
        assert!(!dir.path().join("rejected").exists());
        assert!(!dir.path().join("last_error").exists());
        assert_eq!(control.snapshot().unwrap().version, 3);
    }

    #[test]
    fn repeated_rejections_overwrite_diagnostics() {
        let dir = TempDir::new().unwrap();
        let mut control: ControlDir<Doc> = ControlDir::new(dir.path());

        write(&dir, "new", "first bogus");
        assert!(!control.poll().unwrap());
        write(&dir, "new", "second bogus");
        assert!(!control.poll().unwrap());

        assert_eq!(
            std::fs::read_to_string(dir.path().join("rejected")).unwrap(),
            "second bogus"
        );
    }
}
