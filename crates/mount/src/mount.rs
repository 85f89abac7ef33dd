//! Helpers for interacting with mountpoints

use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use rustix::mount::UnmountFlags;
use snapos_utils::CommandRunExt;

/// Mount `source` at `target` via `mount(8)`.
///
/// `fstype` is passed as `-t` when set and `options` are joined into a
/// single `-o` argument.
#[context("Mounting {source} at {target}")]
pub fn mount(
    source: &str,
    target: &Utf8Path,
    fstype: Option<&str>,
    options: &[&str],
) -> Result<()> {
    let mut cmd = Command::new("mount");
    if let Some(fstype) = fstype.filter(|v| !v.is_empty()) {
        cmd.args(["-t", fstype]);
    }
    if !options.is_empty() {
        cmd.args(["-o", &options.join(",")]);
    }
    cmd.args([source, target.as_str()])
        .log_debug()
        .run_capture_stderr()
}

/// Change the options of an existing mount, e.g. `rw` or `ro`.
#[context("Remounting {target}")]
pub fn remount(target: &Utf8Path, options: &[&str]) -> Result<()> {
    let opts = std::iter::once("remount")
        .chain(options.iter().copied())
        .collect::<Vec<_>>()
        .join(",");
    Command::new("mount")
        .args(["-o", &opts, target.as_str()])
        .log_debug()
        .run_capture_stderr()
}

/// Unmount the filesystem at `target`.
#[context("Unmounting {target}")]
pub fn unmount(target: &Utf8Path) -> Result<()> {
    tracing::debug!("Unmounting {target}");
    rustix::mount::unmount(target.as_std_path(), UnmountFlags::empty())?;
    Ok(())
}

/// Returns true if `path` is the root of a mounted filesystem. A missing
/// path is not a mountpoint.
#[context("Checking mountpoint {path}")]
pub fn is_mountpoint(path: &Utf8Path) -> Result<bool> {
    let dir = match Dir::open_ambient_dir(path, cap_std::ambient_authority()) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("Opening {path}")),
    };
    if let Some(r) = dir.is_mountpoint(".")? {
        return Ok(r);
    }
    // Older kernels without mount IDs in statx; compare the device with the parent.
    let ours = rustix::fs::stat(path.as_std_path())?;
    let parent = rustix::fs::stat(path.join("..").as_std_path())?;
    Ok(ours.st_dev != parent.st_dev || ours.st_ino == parent.st_ino)
}
