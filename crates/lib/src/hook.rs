//! Site-specific hooks run at fixed points of every workflow.
//!
//! Hooks are cloud-init style stages executed by `yip` over the
//! configured cloud-init paths.

use std::fmt;
use std::process::Command;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use snapos_utils::{ChrootCmd, CommandRunExt};

/// The points at which hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    /// Once the partitions are mounted, before deployment.
    BeforeInstall,
    /// Inside the new tree, after deployment.
    AfterInstallChroot,
    /// After deployment.
    AfterInstall,
    /// After the transaction is committed.
    PostInstall,
    /// Before the reset image is deployed.
    BeforeReset,
    /// Inside the new tree, after deployment.
    AfterResetChroot,
    /// After deployment.
    AfterReset,
    /// After the transaction is committed.
    PostReset,
    /// Before the new snapshot is deployed.
    BeforeUpgrade,
    /// Inside the new tree, after deployment.
    AfterUpgradeChroot,
    /// After deployment.
    AfterUpgrade,
    /// After the transaction is committed.
    PostUpgrade,
}

impl HookPhase {
    /// The stage name handed to the hook runner.
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            HookPhase::BeforeInstall => "before-install",
            HookPhase::AfterInstallChroot => "after-install-chroot",
            HookPhase::AfterInstall => "after-install",
            HookPhase::PostInstall => "post-install",
            HookPhase::BeforeReset => "before-reset",
            HookPhase::AfterResetChroot => "after-reset-chroot",
            HookPhase::AfterReset => "after-reset",
            HookPhase::PostReset => "post-reset",
            HookPhase::BeforeUpgrade => "before-upgrade",
            HookPhase::AfterUpgradeChroot => "after-upgrade-chroot",
            HookPhase::AfterUpgrade => "after-upgrade",
            HookPhase::PostUpgrade => "post-upgrade",
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bind mounts applied when a hook runs inside a deployed tree.
pub(crate) type Binds = Vec<(Utf8PathBuf, Utf8PathBuf)>;

/// Runs hooks.
pub(crate) trait HookRunner: fmt::Debug {
    /// Run the stage `phase` from `extra_paths`. `strict` tells the
    /// runner that any failing step must be reported.
    fn run(&self, phase: HookPhase, strict: bool, extra_paths: &[Utf8PathBuf]) -> Result<()>;

    /// Run the stage `phase` with `root` as the filesystem root.
    fn run_chroot(
        &self,
        phase: HookPhase,
        strict: bool,
        root: &Utf8Path,
        binds: &Binds,
        extra_paths: &[Utf8PathBuf],
    ) -> Result<()>;
}

/// Runs hooks with the `yip` binary.
#[derive(Debug, Default)]
pub(crate) struct Yip;

fn yip_args(phase: HookPhase, strict: bool, paths: &[Utf8PathBuf]) -> Vec<String> {
    let mut args = vec!["-s".to_owned(), phase.as_str().to_owned()];
    if !strict {
        args.push("--continue-on-error".to_owned());
    }
    args.extend(paths.iter().map(|p| p.to_string()));
    args
}

impl HookRunner for Yip {
    #[context("Running stage {phase}")]
    fn run(&self, phase: HookPhase, strict: bool, extra_paths: &[Utf8PathBuf]) -> Result<()> {
        Command::new("yip")
            .args(yip_args(phase, strict, extra_paths))
            .log_debug()
            .run_capture_stderr()
    }

    #[context("Running stage {phase} in {root}")]
    fn run_chroot(
        &self,
        phase: HookPhase,
        strict: bool,
        root: &Utf8Path,
        binds: &Binds,
        extra_paths: &[Utf8PathBuf],
    ) -> Result<()> {
        let cmd = binds
            .iter()
            .fold(ChrootCmd::new(root), |cmd, (src, dst)| cmd.bind(src, dst));
        let mut args = vec!["yip".to_owned()];
        args.extend(yip_args(phase, strict, extra_paths));
        cmd.run(args)
    }
}
