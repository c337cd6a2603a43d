//! The profile-runner wrapper script.
//!
//! App processes expect a login-ish environment: everything in
//! `/etc/profile.d` and `/app/.profile.d` sourced before the command runs.
//! The wrapper is materialized as a self-deleting temporary script so no
//! artifact outlives the exec.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use hsup_core::Result;

const PROFILE_RUNNER: &str = r#"#!/bin/bash
export PS1='\[\033[01;34m\]\w\[\033[00m\] \[\033[01;32m\]$ \[\033[00m\]'

if [ -d /etc/profile.d ]; then
  for i in /etc/profile.d/*.sh; do
    if [ -r $i ]; then
      . $i
    fi
  done
  unset i
fi

if [ -d /app/.profile.d ]; then
  for i in /app/.profile.d/*.sh; do
    if [ -r $i ]; then
      . $i
    fi
  done
  unset i
fi

rm $0
exec bash -c "$*"
"#;

/// A materialized wrapper script; the script removes itself when run.
pub struct ProfileRunner {
    path: PathBuf,
}

impl ProfileRunner {
    /// Writes the wrapper to a fresh executable temporary file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or chmodded.
    pub fn materialize() -> Result<Self> {
        let file = tempfile::Builder::new().prefix("pr_").tempfile()?;
        std::fs::write(file.path(), PROFILE_RUNNER)?;

        let mut perms = std::fs::metadata(file.path())?.permissions();
        perms.set_mode(perms.mode() | 0o111);
        std::fs::set_permissions(file.path(), perms)?;

        // The script unlinks itself after exec; nothing to clean up here.
        let (_, path) = file.keep().map_err(|e| e.error)?;
        Ok(Self { path })
    }

    /// The wrapper's path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Argv with the wrapper prepended.
    #[must_use]
    pub fn argv(&self, args: &[String]) -> Vec<String> {
        let mut argv = vec![self.path.to_string_lossy().into_owned()];
        argv.extend_from_slice(args);
        argv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_is_executable_and_prepended() {
        let pr = ProfileRunner::materialize().unwrap();
        let mode = std::fs::metadata(pr.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111 & mode);
        assert_ne!(mode & 0o100, 0, "owner-executable bit must be set");

        let argv = pr.argv(&["./web".to_string(), "-p".to_string()]);
        assert_eq!(argv.len(), 3);
        assert_eq!(argv[0], pr.path().to_string_lossy());
        assert_eq!(&argv[1..], ["./web", "-p"]);

        std::fs::remove_file(pr.path()).unwrap();
    }

    #[test]
    fn wrapper_sources_profiles_and_self_deletes() {
        let content = PROFILE_RUNNER;
        assert!(content.contains("/etc/profile.d/*.sh"));
        assert!(content.contains("/app/.profile.d/*.sh"));
        assert!(content.contains("rm $0"));
        assert!(content.ends_with("exec bash -c \"$*\"\n"));
    }
}
