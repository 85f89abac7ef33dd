//! Populating a directory tree from an [`ImageSource`].

use std::fmt;
use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use snapos_utils::CommandRunExt;

use crate::source::{ImageSource, SourceKind};

pub(crate) trait Deployer: fmt::Debug {
    /// Copy the content of `source` into `target`, returning the content
    /// digest when the source has one.
    fn deploy(&self, target: &Utf8Path, source: &ImageSource) -> Result<Option<String>>;
}

/// Deploys with `podman` for container images and `rsync` for local trees.
#[derive(Debug, Default)]
pub(crate) struct HostDeployer;

fn rsync_command(from: &Utf8Path, to: &Utf8Path) -> Command {
    let mut cmd = Command::new("rsync");
    cmd.args([
        "--archive",
        "--hard-links",
        "--acls",
        "--xattrs",
        "--numeric-ids",
        // Btrfs transactions start from a copy of the active tree
        "--delete",
        "--exclude=/proc/*",
        "--exclude=/sys/*",
        "--exclude=/dev/*",
        "--exclude=/run/*",
        "--exclude=/tmp/*",
    ]);
    cmd.arg(format!("{}/", from.as_str().trim_end_matches('/')));
    cmd.arg(format!("{}/", to.as_str().trim_end_matches('/')));
    cmd
}

fn rsync(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
    rsync_command(from, to).log_debug().run_capture_stderr()
}

impl HostDeployer {
    #[context("Deploying container image {imgref}")]
    fn deploy_oci(target: &Utf8Path, imgref: &str) -> Result<Option<String>> {
        println!("Pulling {imgref}");
        Command::new("podman")
            .args(["pull", "--quiet", imgref])
            .log_debug()
            .run_capture_stderr()?;
        let digest = Command::new("podman")
            .args(["image", "inspect", "--format", "{{.Digest}}", imgref])
            .log_debug()
            .run_get_string()?
            .trim()
            .to_owned();
        let mnt = Command::new("podman")
            .args(["image", "mount", imgref])
            .log_debug()
            .run_get_string()?;
        let mnt = Utf8Path::new(mnt.trim());
        let r = rsync(mnt, target);
        let u = Command::new("podman")
            .args(["image", "unmount", imgref])
            .log_debug()
            .run_capture_stderr();
        r?;
        u?;
        Ok(Some(digest))
    }

    #[context("Deploying image file {file}")]
    fn deploy_file(target: &Utf8Path, file: &Utf8Path) -> Result<()> {
        let td = tempfile::tempdir().context("Creating mount directory")?;
        let mnt = Utf8Path::from_path(td.path())
            .ok_or_else(|| anyhow::anyhow!("Non UTF-8 temporary directory"))?;
        snapos_mount::mount(file.as_str(), mnt, None, &["loop", "ro"])?;
        let r = rsync(mnt, target);
        let u = snapos_mount::unmount(mnt);
        r?;
        u
    }
}

impl Deployer for HostDeployer {
    #[context("Deploying {source} to {target}")]
    fn deploy(&self, target: &Utf8Path, source: &ImageSource) -> Result<Option<String>> {
        if let Some(p) = source.local_path() {
            if !p.try_exists()? {
                anyhow::bail!("{p} does not exist");
            }
        }
        std::fs::create_dir_all(target).with_context(|| format!("Creating {target}"))?;
        match source.kind() {
            SourceKind::Oci(imgref) => Self::deploy_oci(target, imgref),
            SourceKind::Dir(dir) => {
                println!("Copying {dir}");
                rsync(dir, target)?;
                Ok(None)
            }
            SourceKind::File(file) => {
                Self::deploy_file(target, file)?;
                Ok(None)
            }
            SourceKind::Empty => {
                tracing::debug!("Empty source, nothing to deploy to {target}");
                Ok(None)
            }
        }
    }
}
