//! Deploy a new system version as a new snapshot, optionally along with
//! a new recovery system.

use super::{ActionContext, UPGRADE_PHASES, recovery};
use crate::cleanup::CleanupStack;
use crate::error::{ActionError, ErrorKind, WithKind};
use crate::partition::{PartitionRole, mount_rw};
use crate::snapshotter::Snapshotter;
use crate::source::ImageSource;
use crate::state::{FromAction, InstallState, MirrorPolicy, now};

pub(crate) fn upgrade(cx: &ActionContext<'_>) -> Result<(), ActionError> {
    if cx.config.upgrade.recovery && cx.booted.from_recovery {
        return Err(ErrorKind::UpgradeRecoveryFromRecovery.into());
    }
    let mut snapshotter = cx.snapshotter()?;
    let mut cleanup = CleanupStack::new();
    let r = run(cx, &mut *snapshotter, &mut cleanup);
    cx.finish(r, cleanup, &mut *snapshotter, true)?;
    println!("Upgrade complete");
    Ok(())
}

/// The configured source, else the source of the active snapshot.
fn resolve_source(
    cx: &ActionContext<'_>,
    previous: Option<&InstallState>,
) -> Result<ImageSource, ActionError> {
    if let Some(s) = cx.config.upgrade.system.as_ref().filter(|s| !s.is_empty()) {
        return Ok(s.clone());
    }
    match previous.and_then(|s| s.active_snapshot()) {
        Some((id, active)) if !active.source.is_empty() => {
            tracing::info!("No upgrade source given, reusing the source of snapshot {id}");
            Ok(active.source.clone())
        }
        _ => Err(ActionError::new(
            ErrorKind::InvalidConfig,
            anyhow::anyhow!("No upgrade source given and none recorded"),
        )),
    }
}

fn run(
    cx: &ActionContext<'_>,
    snapshotter: &mut dyn Snapshotter,
    cleanup: &mut CleanupStack<'_, dyn Snapshotter>,
) -> Result<(), ActionError> {
    let efi = cx.mountpoint(PartitionRole::Efi)?;
    let state = cx.mountpoint(PartitionRole::State)?;
    let recovery = cx.mountpoint(PartitionRole::Recovery)?;

    for role in [PartitionRole::Efi, PartitionRole::State, PartitionRole::Recovery] {
        let part = cx.parts.require(role)?;
        mount_rw(&cx.toolkit.mounter, part, cleanup).with_kind(ErrorKind::MountPartition(role))?;
    }
    if let Some(part) = cx.parts.get(PartitionRole::Persistent) {
        mount_rw(&cx.toolkit.mounter, part, cleanup)
            .with_kind(ErrorKind::MountPartition(PartitionRole::Persistent))?;
    }

    let previous = cx.load_ledger(&[PartitionRole::State, PartitionRole::Recovery])?;
    if let Some(prev) = previous.as_ref() {
        if prev.snapshotter.kind != snapshotter.kind() {
            return Err(ActionError::new(
                ErrorKind::SnapshotterMismatch,
                anyhow::anyhow!(
                    "Installed with {}, configured {}",
                    prev.snapshotter.kind,
                    snapshotter.kind()
                ),
            ));
        }
        if let Some((id, active)) = prev.active_snapshot() {
            tracing::info!("Upgrading from snapshot {id} ({})", active.source);
        }
    }
    let source = resolve_source(cx, previous.as_ref())?;

    snapshotter
        .init(state, efi)
        .with_kind(ErrorKind::SnapshotterInit)?;
    cx.hook(UPGRADE_PHASES.before)?;
    let snap = cx.open_transaction(snapshotter, cleanup)?;
    let source = cx.deploy_system(&snap, &source)?;
    cx.refine(&snap.work_dir, &UPGRADE_PHASES)?;
    recovery::push_legacy_migration(recovery, cleanup);
    snapshotter
        .close_transaction(&snap)
        .with_kind(ErrorKind::SnapshotterClose)?;

    let recovery_source = if cx.config.upgrade.recovery {
        let explicit = cx
            .config
            .upgrade
            .recovery_system
            .as_ref()
            .filter(|r| !r.is_empty() && r.to_string() != source.to_string());
        let recorded = match explicit {
            Some(r) => {
                let digest = recovery::deploy_recovery(cx, recovery, r)?;
                r.clone().with_digest(digest)
            }
            None => {
                let image = snapshotter
                    .snapshot_to_image_source(&snap)
                    .with_kind(ErrorKind::DeployImage)?;
                recovery::deploy_recovery(cx, recovery, &image)?;
                source.clone()
            }
        };
        Some(recorded)
    } else {
        None
    };
    cx.hook(UPGRADE_PHASES.post)?;

    let date = now();
    let mut ledger =
        previous.unwrap_or_else(|| InstallState::new(cx.config.snapshotter.clone(), &date));
    ledger.date = date.clone();
    ledger.snapshotter = cx.config.snapshotter.clone();
    cx.record_snapshot(&mut ledger, snapshotter, &snap, &source, FromAction::Upgrade, &date)?;
    if let Some(r) = recovery_source {
        cx.record_recovery(&mut ledger, &r, FromAction::Upgrade, &date)?;
    }
    cx.record_data_partitions(&mut ledger);
    cx.write_ledger(&ledger, MirrorPolicy::Required)
}
