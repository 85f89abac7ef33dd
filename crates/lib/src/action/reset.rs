//! Redeploy the system from the recovery partition.

use super::recovery::RECOVERY_IMAGE;
use super::{ActionContext, RESET_PHASES};
use crate::cleanup::CleanupStack;
use crate::error::{ActionError, ErrorKind, WithKind};
use crate::partition::{PartitionRole, mount_rw};
use crate::snapshotter::Snapshotter;
use crate::source::ImageSource;
use crate::state::{FromAction, InstallState, MirrorPolicy, now};

pub(crate) fn reset(cx: &ActionContext<'_>) -> Result<(), ActionError> {
    let mut snapshotter = cx.snapshotter()?;
    let mut cleanup = CleanupStack::new();
    let r = run(cx, &mut *snapshotter, &mut cleanup);
    cx.finish(r, cleanup, &mut *snapshotter, true)?;
    println!("Reset complete");
    Ok(())
}

fn run(
    cx: &ActionContext<'_>,
    snapshotter: &mut dyn Snapshotter,
    cleanup: &mut CleanupStack<'_, dyn Snapshotter>,
) -> Result<(), ActionError> {
    let efi = cx.mountpoint(PartitionRole::Efi)?;
    let state = cx.mountpoint(PartitionRole::State)?;
    let recovery = cx.parts.require(PartitionRole::Recovery)?;

    let mut roles = vec![PartitionRole::State];
    if cx.config.reset.format_persistent {
        roles.push(PartitionRole::Persistent);
    }
    if cx.config.reset.format_oem {
        roles.push(PartitionRole::Oem);
    }
    cx.format_partitions(&roles)?;
    // The recovery partition is usually mounted read-only as the running root
    cx.mount_partitions(&[PartitionRole::Recovery], cleanup)?;
    mount_rw(&cx.toolkit.mounter, recovery, cleanup)
        .with_kind(ErrorKind::MountPartition(PartitionRole::Recovery))?;

    // The state partition was just formatted, only the mirror is left
    let previous = cx.load_ledger(&[PartitionRole::Recovery])?;
    let image = ImageSource::file(recovery.mountpoint.join(RECOVERY_IMAGE));
    let configured = cx.config.reset.system.clone().filter(|s| !s.is_empty());
    let source = configured.clone().unwrap_or_else(|| image.clone());

    cx.hook(RESET_PHASES.before)?;
    snapshotter
        .init(state, efi)
        .with_kind(ErrorKind::SnapshotterInit)?;
    let snap = cx.open_transaction(snapshotter, cleanup)?;
    let deployed = cx.deploy_system(&snap, &source)?;
    cx.refine(&snap.work_dir, &RESET_PHASES)?;
    snapshotter
        .close_transaction(&snap)
        .with_kind(ErrorKind::SnapshotterClose)?;
    cx.hook(RESET_PHASES.post)?;

    // Resetting from the recovery image records what the image was built from
    let recovery_entry = previous
        .as_ref()
        .and_then(|s| s.partition(PartitionRole::Recovery))
        .cloned();
    let recorded = match (configured, recovery_entry.as_ref()) {
        (Some(_), _) => deployed,
        (None, Some(p)) => p
            .recovery
            .as_ref()
            .map(|r| r.source_with_digest())
            .unwrap_or(image),
        (None, None) => image,
    };

    let date = now();
    let mut ledger = InstallState::new(cx.config.snapshotter.clone(), &date);
    if let Some(p) = recovery_entry {
        ledger
            .partitions
            .insert(PartitionRole::Recovery.name().to_owned(), p);
    }
    cx.record_snapshot(&mut ledger, snapshotter, &snap, &recorded, FromAction::Reset, &date)?;
    cx.record_data_partitions(&mut ledger);
    cx.write_ledger(&ledger, MirrorPolicy::BestEffort)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{BootedSystem, install, run_action};
    use crate::config::RunConfig;
    use crate::hook::HookPhase;
    use crate::testutil::Harness;

    const RECOVERY_BOOT: BootedSystem = BootedSystem {
        from_recovery: true,
        snapshot: None,
    };

    fn installed() -> anyhow::Result<Harness> {
        let h = Harness::new();
        let config = RunConfig::from_toml(indoc::indoc! { r#"
            [install]
            system = "oci://registry.example.com/os:v1"
        "# })?;
        run_action(&h, &config, BootedSystem::default(), install)?;
        Ok(h)
    }

    #[test]
    fn test_reset_from_recovery() -> anyhow::Result<()> {
        let h = installed()?;
        let oem = h.mountpoint(PartitionRole::Oem);
        std::fs::write(oem.join("90_custom.yaml"), "stages: {}")?;
        let before = h.ledger().unwrap();

        run_action(&h, &RunConfig::default(), RECOVERY_BOOT, reset)?;

        assert_eq!(h.formatter.formatted().last().unwrap(), "COS_STATE");
        assert_eq!(h.formatter.formatted().len(), 6);
        // Not formatted
        assert!(oem.join("90_custom.yaml").exists());
        assert_eq!(h.snapshot_dirs(), [1]);
        assert_eq!(h.ledger_snapshots(), [(1, true)]);

        let recovery = h.mountpoint(PartitionRole::Recovery);
        let (_, deployed) = h.deployer.deployed().pop().unwrap();
        assert_eq!(deployed, format!("file://{recovery}/recovery.img"));

        let ledger = h.ledger().unwrap();
        let (_, active) = ledger.active_snapshot().unwrap();
        assert_eq!(active.from_action, Some(FromAction::Reset));
        assert_eq!(active.source.to_string(), "oci://registry.example.com/os:v1");
        assert_eq!(active.digest, before.active_snapshot().unwrap().1.digest);
        // The recovery entry is carried over untouched
        assert_eq!(ledger.recovery_image(), before.recovery_image());
        assert_eq!(h.mirror().unwrap(), ledger);

        let runs: Vec<HookPhase> = h.hooks.runs().into_iter().skip(4).map(|r| r.0).collect();
        assert_eq!(
            runs,
            [
                HookPhase::BeforeReset,
                HookPhase::AfterResetChroot,
                HookPhase::AfterReset,
                HookPhase::PostReset,
            ]
        );
        Ok(())
    }

    #[test]
    fn test_reset_format_data() -> anyhow::Result<()> {
        let h = installed()?;
        let oem = h.mountpoint(PartitionRole::Oem);
        std::fs::write(oem.join("90_custom.yaml"), "stages: {}")?;
        let config = RunConfig::from_toml(indoc::indoc! { r#"
            [reset]
            system = "dir:///run/rootfs"
            format-oem = true
            format-persistent = true
        "# })?;
        run_action(&h, &config, RECOVERY_BOOT, reset)?;
        assert_eq!(
            h.formatter.formatted()[5..],
            ["COS_OEM", "COS_PERSISTENT", "COS_STATE"]
        );
        assert!(!oem.join("90_custom.yaml").exists());
        let ledger = h.ledger().unwrap();
        let (_, active) = ledger.active_snapshot().unwrap();
        assert_eq!(active.source.to_string(), "dir:///run/rootfs");
        assert!(active.digest.is_empty());
        Ok(())
    }

    #[test]
    fn test_reset_without_ledger() -> anyhow::Result<()> {
        let h = Harness::new();
        let recovery = h.mountpoint(PartitionRole::Recovery);
        std::fs::create_dir_all(&recovery)?;
        std::fs::write(recovery.join(RECOVERY_IMAGE), "image")?;
        run_action(&h, &RunConfig::default(), RECOVERY_BOOT, reset)?;
        let ledger = h.ledger().unwrap();
        let (id, active) = ledger.active_snapshot().unwrap();
        assert_eq!(id, 1);
        assert_eq!(active.source.to_string(), format!("file://{recovery}/recovery.img"));
        assert!(ledger.recovery_image().is_none());
        Ok(())
    }
}
