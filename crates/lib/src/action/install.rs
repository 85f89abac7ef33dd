//! First deployment onto an already partitioned disk.

use super::{ActionContext, INSTALL_PHASES, recovery};
use crate::cleanup::CleanupStack;
use crate::error::{ActionError, ErrorKind, WithKind};
use crate::partition::PartitionRole;
use crate::snapshotter::Snapshotter;
use crate::source::ImageSource;
use crate::state::{FromAction, InstallState, MirrorPolicy, now};

pub(crate) fn install(cx: &ActionContext<'_>) -> Result<(), ActionError> {
    let source = cx
        .config
        .install
        .system
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ActionError::new(ErrorKind::InvalidConfig, anyhow::anyhow!("No system source to install"))
        })?;
    let mut snapshotter = cx.snapshotter()?;
    let mut cleanup = CleanupStack::new();
    let r = run(cx, &source, &mut *snapshotter, &mut cleanup);
    cx.finish(r, cleanup, &mut *snapshotter, true)?;
    println!("Installation complete");
    Ok(())
}

fn run(
    cx: &ActionContext<'_>,
    source: &ImageSource,
    snapshotter: &mut dyn Snapshotter,
    cleanup: &mut CleanupStack<'_, dyn Snapshotter>,
) -> Result<(), ActionError> {
    let efi = cx.mountpoint(PartitionRole::Efi)?;
    let state = cx.mountpoint(PartitionRole::State)?;
    let recovery = cx.mountpoint(PartitionRole::Recovery)?;

    if cx.config.install.no_format {
        tracing::info!("Not formatting partitions");
    } else {
        cx.format_partitions(&PartitionRole::ALL)?;
    }
    cx.mount_partitions(&[], cleanup)?;
    cx.hook(INSTALL_PHASES.before)?;

    snapshotter
        .init(state, efi)
        .with_kind(ErrorKind::SnapshotterInit)?;
    let snap = cx.open_transaction(snapshotter, cleanup)?;
    let source = cx.deploy_system(&snap, source)?;
    cx.refine(&snap.work_dir, &INSTALL_PHASES)?;
    snapshotter
        .close_transaction(&snap)
        .with_kind(ErrorKind::SnapshotterClose)?;

    // Without an explicit recovery source the recovery system is built
    // from the committed snapshot.
    let recovery_source = match cx.config.install.recovery_system.as_ref() {
        Some(s) => {
            let digest = recovery::deploy_recovery(cx, recovery, s)?;
            s.clone().with_digest(digest)
        }
        None => {
            let from_snapshot = snapshotter
                .snapshot_to_image_source(&snap)
                .with_kind(ErrorKind::DeployImage)?;
            recovery::deploy_recovery(cx, recovery, &from_snapshot)?;
            source.clone()
        }
    };
    cx.hook(INSTALL_PHASES.post)?;

    let date = now();
    let mut ledger = InstallState::new(cx.config.snapshotter.clone(), &date);
    cx.record_snapshot(&mut ledger, snapshotter, &snap, &source, FromAction::Install, &date)?;
    cx.record_recovery(&mut ledger, &recovery_source, FromAction::Install, &date)?;
    cx.record_data_partitions(&mut ledger);
    cx.write_ledger(&ledger, MirrorPolicy::Required)
}
