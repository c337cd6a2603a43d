//! Stack images: shared read-only base filesystems for containers.
//!
//! Stacks are distributed as binary disk images intended to be mounted on
//! loopback devices. Mounting them read-only lets a single immutable image
//! back many containers, saving disk and memory through page sharing.
//! Fetching images is out of scope here; they are expected to appear as
//! `<stacks>/<name>-<version>.img` files.

use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use tracing::info;

use crate::error::{ContainerError, Result};

/// Picks the newest mounted image directory for `name`, skipping the image
/// files themselves.
///
/// # Errors
///
/// Returns an error when nothing matches.
pub fn current_stack_image_path(stacks_dir: &Path, name: &str) -> Result<PathBuf> {
    let prefix = format!("{name}-");
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(stacks_dir)?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && !n.ends_with(".img"))
        })
        .collect();
    candidates.sort();

    candidates
        .pop()
        .ok_or_else(|| ContainerError::NoStackImage(name.to_string()))
}

/// Ensures the newest image for `name` is loop-mounted read-only at its
/// directory, creating the mount when the directory is empty.
///
/// # Errors
///
/// Returns an error when no image file exists or mounting fails.
pub fn ensure_mounted(stacks_dir: &Path, name: &str) -> Result<PathBuf> {
    let prefix = format!("{name}-");
    let mut images: Vec<PathBuf> = std::fs::read_dir(stacks_dir)?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".img"))
        })
        .collect();
    images.sort();

    let Some(image) = images.pop() else {
        // No image file: accept an already-populated directory (a stack
        // unpacked by other means).
        return current_stack_image_path(stacks_dir, name);
    };

    let dir = image.with_extension("");
    std::fs::create_dir_all(&dir)?;
    if std::fs::read_dir(&dir)?.next().is_some() {
        return Ok(dir); // already mounted
    }

    info!("mounting stack image {image:?} onto {dir:?}");
    let output = std::process::Command::new("mount")
        .args(["-o", "loop,nosuid,nodev,noatime,nodiratime,rw"])
        .arg(&image)
        .arg(&dir)
        .output()?;
    if !output.status.success() {
        return Err(ContainerError::Init(format!(
            "mounting stack image {image:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    // Older images ship without /sys; containers need the mount point.
    std::fs::create_dir_all(dir.join("sys"))?;

    nix::mount::mount(
        None::<&str>,
        &dir,
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| ContainerError::mount(dir.display(), e))?;

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn picks_the_newest_non_image_entry() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("cedar-14-v100")).unwrap();
        std::fs::create_dir(dir.path().join("cedar-14-v99")).unwrap();
        std::fs::File::create(dir.path().join("cedar-14-v100.img")).unwrap();
        std::fs::create_dir(dir.path().join("trusty-1")).unwrap();

        let path = current_stack_image_path(dir.path(), "cedar-14").unwrap();
        assert_eq!(path, dir.path().join("cedar-14-v99"));
    }

    #[test]
    fn missing_stack_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            current_stack_image_path(dir.path(), "cedar-14"),
            Err(ContainerError::NoStackImage(_))
        ));
    }

    #[test]
    fn ensure_mounted_accepts_populated_directories_without_images() {
        let dir = TempDir::new().unwrap();
        let stack = dir.path().join("cedar-14-v7");
        std::fs::create_dir(&stack).unwrap();
        std::fs::File::create(stack.join("etc")).unwrap();

        // No .img present, but a populated directory exists.
        let found = ensure_mounted(dir.path(), "cedar-14").unwrap();
        assert_eq!(found, stack);
    }
}
