//! The recovery partition: `recovery.img` plus the `boot/` directory
//! holding the kernel and initrd booting it.
//!
//! A new recovery system is staged next to the current one as
//! `transition.img` and `boot.transition`, then swapped in with renames.
//! Until the swap nothing the bootloader reads has changed.

use std::io;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{ambient_authority, fs::Dir};
use fn_error_context::context;

use super::ActionContext;
use crate::cleanup::CleanupStack;
use crate::error::{ActionError, ErrorKind, WithKind};
use crate::image::ImageSpec;
use crate::kernel::find_kernel;
use crate::snapshotter::SYSTEM_LABEL;
use crate::source::ImageSource;

pub(crate) const RECOVERY_IMAGE: &str = "recovery.img";
const TRANSITION_IMAGE: &str = "transition.img";
const BOOT_DIR: &str = "boot";
const BOOT_TRANSITION_DIR: &str = "boot.transition";
const BOOT_OLD_DIR: &str = "boot.old";
/// Images lived below this directory in older installs
const LEGACY_IMAGES_DIR: &str = "cOS";

fn remove_path(p: &Utf8Path) -> Result<()> {
    let r = if p.is_dir() {
        std::fs::remove_dir_all(p)
    } else {
        std::fs::remove_file(p)
    };
    match r {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Removing {p}")),
    }
}

/// Recover from a swap interrupted by a crash, and drop stale staging.
///
/// With `boot.old` around, the image rename tells how far the swap got:
/// while `transition.img` still exists `recovery.img` is the old image,
/// so the old boot directory goes back in place.
#[context("Cleaning up {root}")]
fn salvage(root: &Utf8Path) -> Result<()> {
    let boot = root.join(BOOT_DIR);
    let old = root.join(BOOT_OLD_DIR);
    let transition = root.join(BOOT_TRANSITION_DIR);
    if old.try_exists()? {
        let image_swapped = !root.join(TRANSITION_IMAGE).try_exists()?;
        if boot.try_exists()? && image_swapped {
            remove_path(&old)?;
        } else {
            if boot.try_exists()? {
                tracing::warn!("Moving new {boot} back, the image was not replaced");
                remove_path(&transition)?;
                std::fs::rename(&boot, &transition)
                    .with_context(|| format!("Moving {boot} back"))?;
            }
            tracing::warn!("Restoring {boot} from {old}");
            std::fs::rename(&old, &boot).with_context(|| format!("Restoring {boot}"))?;
        }
    }
    remove_path(&transition)?;
    remove_path(&root.join(TRANSITION_IMAGE))
}

/// Copy the kernel and initrd of `tree` to `dest`.
fn stage_boot(tree: &Utf8Path, dest: &Utf8Path) -> Result<bool> {
    let dir = Dir::open_ambient_dir(tree, ambient_authority())
        .with_context(|| format!("Opening {tree}"))?;
    let Some(kernel) = find_kernel(&dir)? else {
        tracing::warn!("No kernel found in {tree}, keeping the current recovery boot files");
        return Ok(false);
    };
    tracing::debug!(
        "Recovery kernel {} (version {})",
        kernel.vmlinuz,
        kernel.version.as_deref().unwrap_or("unknown")
    );
    std::fs::create_dir_all(dest).with_context(|| format!("Creating {dest}"))?;
    for (from, name) in [(&kernel.vmlinuz, "vmlinuz"), (&kernel.initrd, "initrd")] {
        std::fs::copy(tree.join(from), dest.join(name))
            .with_context(|| format!("Copying {from}"))?;
    }
    Ok(true)
}

/// Build `transition.img` and `boot.transition` from `source`. Returns
/// the content digest of the source.
#[context("Staging recovery image from {source}")]
fn stage(cx: &ActionContext<'_>, root: &Utf8Path, source: &ImageSource) -> Result<Option<String>> {
    let td = tempfile::Builder::new()
        .prefix(".recovery-tree")
        .tempdir_in(root)
        .with_context(|| format!("Creating work directory in {root}"))?;
    let tree = Utf8Path::from_path(td.path())
        .ok_or_else(|| anyhow::anyhow!("Non UTF-8 work directory"))?;
    let digest = cx.toolkit.deployer.deploy(tree, source)?;
    stage_boot(tree, &root.join(BOOT_TRANSITION_DIR))?;
    let spec = ImageSpec {
        label: SYSTEM_LABEL.to_owned(),
        fs: cx.config.recovery.fs.clone(),
        size_mib: cx.config.recovery.size_mib,
    };
    cx.toolkit
        .image_maker
        .make(tree, &root.join(TRANSITION_IMAGE), &spec)?;
    Ok(digest)
}

/// Replace the current recovery system by the staged one. `rename`
/// is the only primitive used to modify the partition; if any step
/// fails the previous `boot/` and `recovery.img` are put back.
pub(crate) fn swap_in<R>(root: &Utf8Path, rename: R) -> Result<()>
where
    R: Fn(&Utf8Path, &Utf8Path) -> io::Result<()>,
{
    let boot = root.join(BOOT_DIR);
    let transition = root.join(BOOT_TRANSITION_DIR);
    let old = root.join(BOOT_OLD_DIR);

    let new_boot = transition.try_exists()?;
    let mut moved_old = false;
    if new_boot {
        if boot.try_exists()? {
            rename(&boot, &old).with_context(|| format!("Moving {boot} aside"))?;
            moved_old = true;
        }
        if let Err(e) = rename(&transition, &boot) {
            if moved_old {
                rename(&old, &boot).with_context(|| format!("Restoring {boot}"))?;
            }
            return Err(e).with_context(|| format!("Renaming {transition}"));
        }
    }

    let image = root.join(RECOVERY_IMAGE);
    if let Err(e) = rename(&root.join(TRANSITION_IMAGE), &image) {
        if new_boot {
            rename(&boot, &transition).with_context(|| format!("Moving new {boot} back"))?;
            if moved_old {
                rename(&old, &boot).with_context(|| format!("Restoring {boot}"))?;
            }
        }
        return Err(e).with_context(|| format!("Renaming to {image}"));
    }

    if moved_old {
        if let Err(e) = remove_path(&old) {
            tracing::warn!("{e:#}");
        }
    }
    Ok(())
}

/// Deploy `source` as the new recovery system on the partition mounted
/// at `root`. On failure the current recovery system is untouched.
pub(crate) fn deploy_recovery(
    cx: &ActionContext<'_>,
    root: &Utf8Path,
    source: &ImageSource,
) -> Result<Option<String>, ActionError> {
    println!("Deploying recovery system from {source}");
    salvage(root).with_kind(ErrorKind::ReplaceRecovery)?;
    let digest = match stage(cx, root, source) {
        Ok(d) => d,
        Err(e) => {
            if let Err(se) = salvage(root) {
                tracing::warn!("{se:#}");
            }
            return Err(ActionError::new(ErrorKind::DeployImage, e));
        }
    };
    swap_in(root, |from, to| std::fs::rename(from, to)).with_kind(ErrorKind::ReplaceRecovery)?;
    tracing::info!("Recovery image {} replaced", root.join(RECOVERY_IMAGE));
    Ok(digest)
}

fn legacy_image(root: &Utf8Path) -> Utf8PathBuf {
    root.join(LEGACY_IMAGES_DIR).join(RECOVERY_IMAGE)
}

/// Move an image left at the legacy location to the partition root once
/// the workflow succeeded. If a new image was deployed meanwhile the
/// legacy one is dropped instead.
pub(crate) fn push_legacy_migration<C: ?Sized>(root: &Utf8Path, cleanup: &mut CleanupStack<'_, C>) {
    let legacy = legacy_image(root);
    if !legacy.is_file() {
        return;
    }
    tracing::debug!("Found legacy recovery image {legacy}");
    let image = root.join(RECOVERY_IMAGE);
    cleanup.push_success_only("migrate legacy recovery image", move |_| {
        if image.try_exists()? {
            remove_path(&legacy)
        } else {
            std::fs::rename(&legacy, &image).with_context(|| format!("Moving {legacy}"))
        }
    });
}
