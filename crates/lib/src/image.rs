//! Building filesystem image files from a populated tree.

use std::fmt;
use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use snapos_utils::CommandRunExt;

/// What image to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImageSpec {
    pub(crate) label: String,
    pub(crate) fs: String,
    /// Size in MiB; ignored for squashfs, which is sized by its content.
    pub(crate) size_mib: u64,
}

pub(crate) trait ImageMaker: fmt::Debug {
    /// Create `target` holding the content of `tree`. On failure no
    /// partial `target` is left behind.
    fn make(&self, tree: &Utf8Path, target: &Utf8Path, spec: &ImageSpec) -> Result<()>;
}

/// Builds images with `mksquashfs` and `mkfs.<fs> -d`.
#[derive(Debug, Default)]
pub(crate) struct Mkimage;

fn build_command(tree: &Utf8Path, target: &Utf8Path, spec: &ImageSpec) -> Result<Command> {
    let mut cmd;
    match spec.fs.as_str() {
        "squashfs" => {
            cmd = Command::new("mksquashfs");
            cmd.args([tree.as_str(), target.as_str(), "-b", "1024k", "-no-progress"]);
        }
        "ext2" | "ext3" | "ext4" => {
            cmd = Command::new(format!("mkfs.{}", spec.fs));
            cmd.args(["-F", "-L", &spec.label, "-d", tree.as_str(), target.as_str()]);
        }
        o => anyhow::bail!("Unsupported image filesystem {o}"),
    }
    Ok(cmd)
}

impl Mkimage {
    fn make_inner(tree: &Utf8Path, target: &Utf8Path, spec: &ImageSpec) -> Result<()> {
        let mut cmd = build_command(tree, target, spec)?;
        if spec.fs != "squashfs" {
            let f = std::fs::File::create(target).with_context(|| format!("Creating {target}"))?;
            f.set_len(spec.size_mib * 1024 * 1024)
                .with_context(|| format!("Allocating {target}"))?;
        }
        cmd.log_debug().run_capture_stderr()
    }
}

impl ImageMaker for Mkimage {
    #[context("Creating {} image {target}", spec.fs)]
    fn make(&self, tree: &Utf8Path, target: &Utf8Path, spec: &ImageSpec) -> Result<()> {
        println!("Creating {} image {target}", spec.fs);
        let r = Self::make_inner(tree, target, spec);
        if r.is_err() {
            if let Err(e) = std::fs::remove_file(target) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Removing incomplete {target}: {e}");
                }
            }
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(fs: &str) -> ImageSpec {
        ImageSpec {
            label: "SNAP3".into(),
            fs: fs.into(),
            size_mib: 16,
        }
    }

    #[test]
    fn test_build_command() -> Result<()> {
        let tree = Utf8Path::new("/run/work");
        let target = Utf8Path::new("/run/state/snapshot.img");
        assert_eq!(
            build_command(tree, target, &spec("ext4"))?.to_string_pretty(),
            "mkfs.ext4 -F -L SNAP3 -d /run/work /run/state/snapshot.img"
        );
        assert_eq!(
            build_command(tree, target, &spec("squashfs"))?.to_string_pretty(),
            "mksquashfs /run/work /run/state/snapshot.img -b 1024k -no-progress"
        );
        assert!(build_command(tree, target, &spec("ntfs")).is_err());
        Ok(())
    }
}
