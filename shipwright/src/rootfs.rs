//! Base-OS filesystem export (spec §1, "in scope only at the interface
//! level"): materializes an extracted image directory into a single ext4
//! file via host shell-outs to `dd`, `mkfs.ext4`, `mount`, `umount`.
//!
//! The resulting image becomes the builder VM's sole read-write drive; the
//! Bootstrap Client (C8) mutates it in place for the duration of the build,
//! and the same file is persisted as the run cache's `rootfs.ext4` once the
//! build reports success.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::{Error, Result};

/// Creates an ext4 image at `image_path` sized `size_mb` MiB, mounts it,
/// copies every entry of `source_dir` into it, and unmounts.
///
/// `source_dir` is typically a [`shipwright_deps::Store`]'s `rootfs_path()`
/// — the extracted layers of the recipe's `FROM` base image.
pub async fn create(source_dir: &Path, image_path: &Path, size_mb: u64) -> Result<()> {
    allocate(image_path, size_mb).await?;
    format(image_path).await?;

    let mountpoint = tempfile::tempdir().map_err(Error::Io)?;
    mount(image_path, mountpoint.path()).await?;
    let copy_result = copy_tree(source_dir, mountpoint.path()).await;
    unmount(mountpoint.path()).await?;
    copy_result
}

/// Allocates a sparse file of `size_mb` MiB at `path` via `dd`.
async fn allocate(path: &Path, size_mb: u64) -> Result<()> {
    run_checked(
        "dd",
        [
            "if=/dev/zero".to_owned(),
            format!("of={}", path.display()),
            "bs=1M".to_owned(),
            "count=0".to_owned(),
            format!("seek={size_mb}"),
        ],
    )
    .await
}

/// Formats `path` as ext4 via `mkfs.ext4`.
async fn format(path: &Path) -> Result<()> {
    run_checked("mkfs.ext4", ["-F".to_owned(), path.display().to_string()]).await
}

/// Mounts the ext4 image at `image_path` on `mountpoint`.
pub async fn mount(image_path: &Path, mountpoint: &Path) -> Result<()> {
    run_checked(
        "mount",
        [
            image_path.display().to_string(),
            mountpoint.display().to_string(),
        ],
    )
    .await
}

/// Unmounts `mountpoint`.
pub async fn unmount(mountpoint: &Path) -> Result<()> {
    run_checked("umount", [mountpoint.display().to_string()]).await
}

/// Recursively copies every entry of `source` into `dest`, preserving mode
/// bits (via `cp -a`, matching the rest of the toolchain's habit of shelling
/// out rather than reimplementing a tree copy).
async fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(source).await.map_err(Error::Io)?;
    let mut sources = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(Error::Io)? {
        sources.push(entry.path());
    }
    if sources.is_empty() {
        return Ok(());
    }

    let mut args: Vec<String> = vec!["-a".to_owned()];
    args.extend(sources.iter().map(|p| p.display().to_string()));
    args.push(dest.display().to_string());
    run_checked("cp", args).await
}

/// Runs `program` with `args`, mapping a non-zero exit (or spawn failure)
/// into [`Error::Process`].
async fn run_checked(program: &str, args: impl IntoIterator<Item = String>) -> Result<()> {
    let args: Vec<String> = args.into_iter().collect();
    let output = Command::new(program)
        .args(&args)
        .output()
        .await
        .map_err(Error::Io)?;

    if output.status.success() {
        return Ok(());
    }
    Err(Error::Process {
        program: program.to_owned(),
        code: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Returns the default per-run rootfs destination under a run registry's
/// VM directory (`<run-cache>/runs/<vm-id>/rootfs.ext4`), matching spec §6's
/// run cache layout.
pub fn default_image_path(vm_dir: &Path) -> PathBuf {
    vm_dir.join("rootfs.ext4")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_checked_surfaces_process_error() {
        let err = run_checked("false", Vec::<String>::new()).await.unwrap_err();
        assert!(matches!(err, Error::Process { code, .. } if code != 0));
    }

    #[test]
    fn default_image_path_matches_layout() {
        let vm_dir = Path::new("/cache/runs/abc123");
        assert_eq!(
            default_image_path(vm_dir),
            Path::new("/cache/runs/abc123/rootfs.ext4")
        );
    }
}
