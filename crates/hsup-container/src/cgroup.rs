//! Per-container cgroup membership.
//!
//! Each container gets a cgroup named after its UUID under the supervisor's
//! subtree of the unified hierarchy; the init pid is attached after clone
//! and the group is removed during terminal GC.

use std::path::PathBuf;

use crate::error::Result;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const SUBTREE: &str = "hsup";

fn group_dir(uuid: &str) -> PathBuf {
    PathBuf::from(CGROUP_ROOT).join(SUBTREE).join(uuid)
}

/// Creates the container's cgroup.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn create(uuid: &str) -> Result<()> {
    std::fs::create_dir_all(group_dir(uuid))?;
    Ok(())
}

/// Attaches a pid to the container's cgroup.
///
/// # Errors
///
/// Returns an error if the membership write fails.
pub fn attach(uuid: &str, pid: i32) -> Result<()> {
    std::fs::write(group_dir(uuid).join("cgroup.procs"), format!("{pid}\n"))?;
    Ok(())
}

/// Removes the container's cgroup; valid once its processes are gone.
///
/// # Errors
///
/// Returns an error if the directory cannot be removed.
pub fn remove(uuid: &str) -> Result<()> {
    std::fs::remove_dir(group_dir(uuid))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_path_is_per_uuid() {
        assert_eq!(
            group_dir("abc"),
            PathBuf::from("/sys/fs/cgroup/hsup/abc")
        );
    }
}
