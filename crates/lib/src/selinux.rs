use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{ambient_authority, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use snapos_utils::{ChrootCmd, CommandRunExt};

const SELINUX_CONFIG_PATH: &str = "etc/selinux/config";
const SELINUX_TYPE: &str = "SELINUXTYPE=";
const SETFILES_CANDIDATES: &[&str] = &["usr/sbin/setfiles", "sbin/setfiles", "usr/bin/setfiles"];

/// The `file_contexts` of the policy configured in the tree, if any.
#[context("Getting SELinux file contexts")]
fn file_contexts(root: &Dir) -> Result<Option<Utf8PathBuf>> {
    let Some(config) = root
        .open_optional(SELINUX_CONFIG_PATH)
        .context("Opening selinux config")?
    else {
        return Ok(None);
    };
    let config = std::io::read_to_string(config).context("Reading selinux config")?;

    let type_ = config
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with(SELINUX_TYPE))
        .ok_or_else(|| anyhow::anyhow!("Failed to find SELINUXTYPE"))?
        .split('=')
        .nth(1)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Failed to parse SELINUXTYPE"))?;

    let path = Utf8PathBuf::from(format!("etc/selinux/{type_}/contexts/files/file_contexts"));
    if !root.try_exists(&path)? {
        tracing::debug!("No file contexts at {path}");
        return Ok(None);
    }
    Ok(Some(path))
}

fn find_setfiles(root: &Dir) -> Result<Option<&'static str>> {
    for c in SETFILES_CANDIDATES {
        if root.try_exists(c)? {
            return Ok(Some(*c));
        }
    }
    Ok(None)
}

/// Relabel the deployed `tree` with its own policy. Returns false if the
/// tree has no policy or no `setfiles`.
#[context("Relabeling {tree}")]
pub(crate) fn relabel(tree: &Utf8Path) -> Result<bool> {
    let root = Dir::open_ambient_dir(tree, ambient_authority())
        .with_context(|| format!("Opening {tree}"))?;
    let Some(contexts) = file_contexts(&root)? else {
        tracing::debug!("No SELinux policy in {tree}, skipping relabel");
        return Ok(false);
    };
    let Some(setfiles) = find_setfiles(&root)? else {
        tracing::debug!("Could not find setfiles in {tree}, skipping relabel");
        return Ok(false);
    };
    println!("Applying SELinux labels");
    let setfiles = format!("/{setfiles}");
    let contexts = format!("/{contexts}");
    ChrootCmd::new(tree)
        .command([
            setfiles.as_str(),
            "-F",
            "-e",
            "/dev",
            "-e",
            "/proc",
            "-e",
            "/sys",
            contexts.as_str(),
            "/",
        ])
        .log_debug()
        .run_capture_stderr()?;
    Ok(true)
}
