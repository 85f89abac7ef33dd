//! # Workflows
//!
//! Each workflow is a linear sequence of steps sharing one
//! [`CleanupStack`]. A failing step short-circuits the rest; the stack
//! always runs, and a failure to clean up after an otherwise successful
//! run suppresses the power action.
//!
//! All collaborators come from a [`Toolkit`], so tests can swap every
//! external effect for an in-memory double.

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::bootloader::{Bootloader, GRUB_OEM_ENV, Grub};
use crate::cleanup::CleanupStack;
use crate::config::RunConfig;
use crate::deploy::{Deployer, HostDeployer};
use crate::error::{ActionError, ErrorKind, WithKind};
use crate::hook::{Binds, HookPhase, HookRunner, Yip};
use crate::image::{ImageMaker, Mkimage};
use crate::partition::{
    Formatter, HostMounter, Mkfs, Mounter, Partition, PartitionRole, PartitionSet, mount_all,
    unmount_all,
};
use crate::power::{HostPower, PowerControl};
use crate::snapshotter::{
    BTRFS, Btrfs, BtrfsCli, BtrfsTool, LOOPDEVICE, LoopDevice, SYSTEM_LABEL, Snapshot, Snapshotter,
};
use crate::source::ImageSource;
use crate::state::{
    FromAction, INSTALL_STATE_FILE, InstallState, MirrorPolicy, SystemState, load_install_state,
    write_install_state,
};

mod install;
mod recovery;
mod reset;
mod upgrade;
mod upgrade_recovery;

pub(crate) use install::install;
pub(crate) use reset::reset;
pub(crate) use upgrade::upgrade;
pub(crate) use upgrade_recovery::upgrade_recovery;

const CMDLINE_PATH: &str = "/proc/cmdline";
/// Kernel argument values booting the recovery image end with this.
const RECOVERY_IMAGE_ARG: &str = "recovery.img";
const SNAPSHOTS_ARG: &str = ".snapshots/";
/// Where the OEM partition is bound inside a chroot
const OEM_PATH: &str = "/oem";
/// Where the persistent partition is bound inside a chroot
const PERSISTENT_PATH: &str = "/usr/local";

/// The external effects a workflow may have.
#[derive(Debug, Clone)]
pub(crate) struct Toolkit {
    pub(crate) mounter: Rc<dyn Mounter>,
    pub(crate) formatter: Rc<dyn Formatter>,
    pub(crate) bootloader: Rc<dyn Bootloader>,
    pub(crate) deployer: Rc<dyn Deployer>,
    pub(crate) image_maker: Rc<dyn ImageMaker>,
    pub(crate) btrfs: Rc<dyn BtrfsTool>,
    pub(crate) hooks: Rc<dyn HookRunner>,
    pub(crate) power: Rc<dyn PowerControl>,
}

impl Toolkit {
    /// The implementations acting on the running host.
    pub(crate) fn host() -> Self {
        Self {
            mounter: Rc::new(HostMounter),
            formatter: Rc::new(Mkfs),
            bootloader: Rc::new(Grub),
            deployer: Rc::new(HostDeployer),
            image_maker: Rc::new(Mkimage),
            btrfs: Rc::new(BtrfsCli),
            hooks: Rc::new(Yip),
            power: Rc::new(HostPower),
        }
    }
}

/// What the running system booted from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BootedSystem {
    pub(crate) from_recovery: bool,
    /// The snapshot booted, when booted from one.
    pub(crate) snapshot: Option<u32>,
}

/// Parse `.../.snapshots/<id>/snapshot.img`, or the subvolume
/// `.../.snapshots/<id>/snapshot`.
fn parse_snapshot_arg(value: &str) -> Option<u32> {
    let (_, rest) = value.split_once(SNAPSHOTS_ARG)?;
    let (id, file) = rest.split_once('/')?;
    matches!(file, "snapshot.img" | "snapshot")
        .then(|| id.parse().ok())
        .flatten()
}

impl BootedSystem {
    pub(crate) fn from_cmdline(cmdline: &str) -> Self {
        let mut r = Self::default();
        for arg in cmdline.split_ascii_whitespace() {
            let Some((_, value)) = arg.split_once('=') else {
                continue;
            };
            if value.ends_with(RECOVERY_IMAGE_ARG) {
                r.from_recovery = true;
            } else if let Some(id) = parse_snapshot_arg(value) {
                r.snapshot = Some(id);
            }
        }
        r
    }

    #[context("Reading {CMDLINE_PATH}")]
    pub(crate) fn detect() -> Result<Self> {
        match std::fs::read_to_string(CMDLINE_PATH) {
            Ok(c) => Ok(Self::from_cmdline(&c)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

/// The hook phases of one workflow.
#[derive(Debug, Clone, Copy)]
struct Phases {
    before: HookPhase,
    after_chroot: HookPhase,
    after: HookPhase,
    post: HookPhase,
}

const INSTALL_PHASES: Phases = Phases {
    before: HookPhase::BeforeInstall,
    after_chroot: HookPhase::AfterInstallChroot,
    after: HookPhase::AfterInstall,
    post: HookPhase::PostInstall,
};

const RESET_PHASES: Phases = Phases {
    before: HookPhase::BeforeReset,
    after_chroot: HookPhase::AfterResetChroot,
    after: HookPhase::AfterReset,
    post: HookPhase::PostReset,
};

const UPGRADE_PHASES: Phases = Phases {
    before: HookPhase::BeforeUpgrade,
    after_chroot: HookPhase::AfterUpgradeChroot,
    after: HookPhase::AfterUpgrade,
    post: HookPhase::PostUpgrade,
};

/// Everything a workflow runs against.
#[derive(Debug)]
pub(crate) struct ActionContext<'a> {
    pub(crate) config: &'a RunConfig,
    pub(crate) toolkit: &'a Toolkit,
    pub(crate) parts: &'a PartitionSet,
    pub(crate) booted: BootedSystem,
}

impl ActionContext<'_> {
    /// The snapshotter of the configured type.
    fn snapshotter(&self) -> Result<Box<dyn Snapshotter>, ActionError> {
        let config = self.config.snapshotter.clone();
        let bootloader = Rc::clone(&self.toolkit.bootloader);
        let booted = self.booted.snapshot;
        match config.kind.as_str() {
            LOOPDEVICE => {
                let maker = Rc::clone(&self.toolkit.image_maker);
                Ok(Box::new(LoopDevice::new(config, bootloader, maker, booted)))
            }
            BTRFS => {
                let tool = Rc::clone(&self.toolkit.btrfs);
                Ok(Box::new(Btrfs::new(config, bootloader, tool, booted)))
            }
            o => Err(ActionError::new(
                ErrorKind::InvalidConfig,
                anyhow::anyhow!("Unsupported snapshotter type {o}"),
            )),
        }
    }

    fn mountpoint(&self, role: PartitionRole) -> Result<&Utf8Path, ActionError> {
        Ok(&self.parts.require(role)?.mountpoint)
    }

    fn label(&self, role: PartitionRole) -> Result<&str, ActionError> {
        Ok(&self.parts.require(role)?.label)
    }

    fn hook_result(&self, phase: HookPhase, r: Result<()>) -> Result<(), ActionError> {
        match r {
            Ok(()) => Ok(()),
            Err(e) if self.config.strict => Err(ActionError::new(ErrorKind::Hook(phase), e)),
            Err(e) => {
                tracing::error!("Ignoring failure of {phase} hook: {e:#}");
                Ok(())
            }
        }
    }

    /// Run a hook; failures only count in strict mode.
    fn hook(&self, phase: HookPhase) -> Result<(), ActionError> {
        tracing::info!("Running {phase} hook");
        let r = self
            .toolkit
            .hooks
            .run(phase, self.config.strict, &self.config.cloud_init_paths);
        self.hook_result(phase, r)
    }

    /// The OEM and persistent partitions, where mounted.
    fn chroot_binds(&self) -> Binds {
        let mut binds = Binds::new();
        for (role, dest) in [
            (PartitionRole::Oem, OEM_PATH),
            (PartitionRole::Persistent, PERSISTENT_PATH),
        ] {
            let Some(p) = self.parts.get(role) else {
                continue;
            };
            match self.toolkit.mounter.is_mountpoint(&p.mountpoint) {
                Ok(true) => binds.push((p.mountpoint.clone(), Utf8PathBuf::from(dest))),
                Ok(false) => {}
                Err(e) => tracing::debug!("Not binding {}: {e:#}", p.mountpoint),
            }
        }
        binds
    }

    fn chroot_hook(&self, phase: HookPhase, root: &Utf8Path) -> Result<(), ActionError> {
        tracing::info!("Running {phase} hook in {root}");
        let r = self.toolkit.hooks.run_chroot(
            phase,
            self.config.strict,
            root,
            &self.chroot_binds(),
            &self.config.cloud_init_paths,
        );
        self.hook_result(phase, r)
    }

    /// Partition labels exposed to the bootloader.
    fn grub_labels(&self) -> BTreeMap<String, String> {
        let labels = &self.config.labels;
        BTreeMap::from([
            ("state_label".to_owned(), labels.label(PartitionRole::State).to_owned()),
            ("recovery_label".to_owned(), labels.label(PartitionRole::Recovery).to_owned()),
            ("oem_label".to_owned(), labels.label(PartitionRole::Oem).to_owned()),
            ("persistent_label".to_owned(), labels.label(PartitionRole::Persistent).to_owned()),
            ("system_label".to_owned(), SYSTEM_LABEL.to_owned()),
        ])
    }

    /// Mount every partition except `exclude`, registering an unmount for
    /// each one mounted here.
    fn mount_partitions<C: ?Sized>(
        &self,
        exclude: &[PartitionRole],
        cleanup: &mut CleanupStack<'_, C>,
    ) -> Result<(), ActionError> {
        let parts = self.parts.by_mount_order(exclude);
        mount_all(&self.toolkit.mounter, &parts, cleanup).with_kind(ErrorKind::MountPartitions)
    }

    /// Unmount and format `roles`, skipping undefined ones.
    fn format_partitions(&self, roles: &[PartitionRole]) -> Result<(), ActionError> {
        let parts: Vec<&Partition> = self
            .parts
            .by_mount_order(&[])
            .into_iter()
            .filter(|p| roles.contains(&p.role))
            .collect();
        unmount_all(&*self.toolkit.mounter, &parts).with_kind(ErrorKind::UnmountPartitions)?;
        for p in parts {
            self.toolkit
                .formatter
                .format(p)
                .with_kind(ErrorKind::FormatPartition)?;
        }
        Ok(())
    }

    /// Start a transaction and register its rollback.
    fn open_transaction(
        &self,
        snapshotter: &mut dyn Snapshotter,
        cleanup: &mut CleanupStack<'_, dyn Snapshotter>,
    ) -> Result<Snapshot, ActionError> {
        let snap = snapshotter
            .start_transaction()
            .with_kind(ErrorKind::SnapshotterStart)?;
        let s = snap.clone();
        cleanup.push_error_only(format!("roll back snapshot {}", snap.id), move |snapshotter| {
            snapshotter.close_transaction_on_error(&s)
        });
        Ok(snap)
    }

    /// Deploy `source` into the snapshot; returns the source with its
    /// content digest attached.
    fn deploy_system(&self, snap: &Snapshot, source: &ImageSource) -> Result<ImageSource, ActionError> {
        println!("Deploying {source} to snapshot {}", snap.id);
        let digest = self
            .toolkit
            .deployer
            .deploy(&snap.work_dir, source)
            .with_kind(ErrorKind::DeploySource)?
            .or_else(|| source.digest().map(ToOwned::to_owned));
        Ok(source.clone().with_digest(digest))
    }

    /// Make the deployed tree bootable and customized.
    fn refine(&self, tree: &Utf8Path, phases: &Phases) -> Result<(), ActionError> {
        let efi = self.mountpoint(PartitionRole::Efi)?;
        let bootloader = &self.toolkit.bootloader;
        bootloader
            .install(tree, efi)
            .with_kind(ErrorKind::BootloaderInstall)?;
        if !crate::selinux::relabel(tree).with_kind(ErrorKind::SelinuxRelabel)? {
            tracing::debug!("Tree {tree} not relabeled");
        }
        self.chroot_hook(phases.after_chroot, tree)?;
        self.hook(phases.after)?;
        bootloader
            .set_persistent_variables(&efi.join(GRUB_OEM_ENV), &self.grub_labels())
            .with_kind(ErrorKind::BootloaderVariables)?;
        bootloader
            .set_default_entry(efi, tree, self.config.grub_default_entry.as_deref())
            .with_kind(ErrorKind::DefaultEntry)?;
        Ok(())
    }

    /// Load the ledger from the first of `roles` that has one.
    fn load_ledger(&self, roles: &[PartitionRole]) -> Result<Option<InstallState>, ActionError> {
        for role in roles {
            let Some(p) = self.parts.get(*role) else {
                continue;
            };
            let path = p.mountpoint.join(INSTALL_STATE_FILE);
            if let Some(state) = load_install_state(&path).with_kind(ErrorKind::LedgerRead)? {
                tracing::debug!("Loaded install state from {path}");
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    /// Record `source` as the current recovery image.
    fn record_recovery(
        &self,
        state: &mut InstallState,
        source: &ImageSource,
        from_action: FromAction,
        date: &str,
    ) -> Result<(), ActionError> {
        let label = self.label(PartitionRole::Recovery)?;
        let entry = SystemState::new(source, from_action, date)
            .with_image(SYSTEM_LABEL, &self.config.recovery.fs);
        state.partition_mut(PartitionRole::Recovery, label).recovery = Some(entry);
        Ok(())
    }

    /// Record `source` as the new active snapshot `snap`.
    fn record_snapshot(
        &self,
        state: &mut InstallState,
        snapshotter: &dyn Snapshotter,
        snap: &Snapshot,
        source: &ImageSource,
        from_action: FromAction,
        date: &str,
    ) -> Result<(), ActionError> {
        let existing = snapshotter
            .get_snapshots()
            .with_kind(ErrorKind::LedgerWrite)?;
        // Subvolumes carry no image of their own
        let fs = match snapshotter.kind() {
            BTRFS => BTRFS,
            _ => self.config.snapshotter.config.fs.as_str(),
        };
        let entry = SystemState::new(source, from_action, date).with_image(SYSTEM_LABEL, fs);
        let label = self.label(PartitionRole::State)?;
        state.reconcile_snapshots(label, snap.id, entry, &existing);
        Ok(())
    }

    /// Make sure the OEM and persistent partitions are listed.
    fn record_data_partitions(&self, state: &mut InstallState) {
        for role in [PartitionRole::Oem, PartitionRole::Persistent] {
            if let Some(p) = self.parts.get(role) {
                state.partition_mut(role, &p.label);
            }
        }
    }

    /// Write the ledger to the state partition, then mirror it to the
    /// recovery partition.
    fn write_ledger(&self, state: &InstallState, policy: MirrorPolicy) -> Result<(), ActionError> {
        let primary = self
            .mountpoint(PartitionRole::State)?
            .join(INSTALL_STATE_FILE);
        let mirror = self
            .mountpoint(PartitionRole::Recovery)?
            .join(INSTALL_STATE_FILE);
        write_install_state(state, &primary, Some(mirror.as_path()), policy)
            .with_kind(ErrorKind::LedgerWrite)
    }

    /// Run the cleanup stack and, if everything went well, the power
    /// action. A primary failure wins over a cleanup failure.
    fn finish<C: ?Sized>(
        &self,
        result: Result<(), ActionError>,
        cleanup: CleanupStack<'_, C>,
        ctx: &mut C,
        power: bool,
    ) -> Result<(), ActionError> {
        if let Err(e) = result {
            if let Err(ce) = cleanup.run(ctx, true) {
                tracing::error!("Cleanup after failure: {ce:#}");
            }
            return Err(e);
        }
        cleanup.run(ctx, false).with_kind(ErrorKind::Cleanup)?;
        if !power {
            return Ok(());
        }
        if let Some(action) = self.config.power {
            tracing::info!("Running power action {action}");
            action
                .run(&*self.toolkit.power)
                .with_kind(ErrorKind::Power(action))?;
        }
        Ok(())
    }
}

/// Read the ledger, mounting the state partition if needed.
pub(crate) fn read_state(cx: &ActionContext<'_>) -> Result<Option<InstallState>, ActionError> {
    let mut cleanup = CleanupStack::<()>::new();
    let r = (|| -> Result<Option<InstallState>, ActionError> {
        let part = cx.parts.require(PartitionRole::State)?;
        mount_all(&cx.toolkit.mounter, &[part], &mut cleanup)
            .with_kind(ErrorKind::MountPartition(PartitionRole::State))?;
        cx.load_ledger(&[PartitionRole::State, PartitionRole::Recovery])
    })();
    match r {
        Ok(state) => cx.finish(Ok(()), cleanup, &mut (), false).map(|()| state),
        Err(e) => cx.finish(Err(e), cleanup, &mut (), false).map(|()| None),
    }
}

/// Run `action` against the fakes of `h`.
#[cfg(test)]
pub(crate) fn run_action<F>(
    h: &crate::testutil::Harness,
    config: &RunConfig,
    booted: BootedSystem,
    action: F,
) -> Result<(), ActionError>
where
    F: FnOnce(&ActionContext<'_>) -> Result<(), ActionError>,
{
    let toolkit = h.toolkit();
    let cx = ActionContext {
        config,
        toolkit: &toolkit,
        parts: &h.parts,
        booted,
    };
    action(&cx)
}
