//! Replace only the recovery system.

use super::{ActionContext, recovery};
use crate::cleanup::CleanupStack;
use crate::error::{ActionError, ErrorKind, WithKind};
use crate::partition::{PartitionRole, mount_rw};
use crate::state::{FromAction, InstallState, MirrorPolicy, now};

pub(crate) fn upgrade_recovery(cx: &ActionContext<'_>) -> Result<(), ActionError> {
    if cx.booted.from_recovery {
        return Err(ErrorKind::UpgradeRecoveryFromRecovery.into());
    }
    let source = cx
        .config
        .upgrade_recovery
        .recovery_system
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ActionError::new(
                ErrorKind::InvalidConfig,
                anyhow::anyhow!("No recovery system source given"),
            )
        })?;
    let update_state = cx.config.upgrade_recovery.update_install_state;

    let mut cleanup = CleanupStack::<()>::new();
    let r = (|| -> Result<(), ActionError> {
        let recovery = cx.parts.require(PartitionRole::Recovery)?;
        mount_rw(&cx.toolkit.mounter, recovery, &mut cleanup)
            .with_kind(ErrorKind::MountPartition(PartitionRole::Recovery))?;
        let mut ledger = None;
        if update_state {
            let state = cx.parts.require(PartitionRole::State)?;
            mount_rw(&cx.toolkit.mounter, state, &mut cleanup)
                .with_kind(ErrorKind::MountPartition(PartitionRole::State))?;
            ledger = cx.load_ledger(&[PartitionRole::State, PartitionRole::Recovery])?;
        }

        let digest = recovery::deploy_recovery(cx, &recovery.mountpoint, &source)?;

        if update_state {
            let date = now();
            let mut ledger =
                ledger.unwrap_or_else(|| InstallState::new(cx.config.snapshotter.clone(), &date));
            ledger.date = date.clone();
            let source = source.clone().with_digest(digest);
            cx.record_recovery(&mut ledger, &source, FromAction::UpgradeRecovery, &date)?;
            cx.write_ledger(&ledger, MirrorPolicy::BestEffort)?;
        }
        Ok(())
    })();
    cx.finish(r, cleanup, &mut (), false)?;
    println!("Recovery upgrade complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{BootedSystem, install, run_action};
    use crate::config::RunConfig;
    use crate::testutil::Harness;

    fn installed() -> anyhow::Result<(Harness, RunConfig)> {
        let h = Harness::new();
        let config = RunConfig::from_toml(indoc::indoc! { r#"
            reboot = true
            [install]
            system = "oci://registry.example.com/os:v1"
            [upgrade-recovery]
            recovery-system = "oci://registry.example.com/recovery:v2"
            update-install-state = true
        "# })?;
        run_action(&h, &config, BootedSystem::default(), install)?;
        Ok((h, config))
    }

    fn run_upgrade_recovery(h: &Harness, config: &RunConfig) -> Result<(), ActionError> {
        run_action(h, config, BootedSystem::default(), upgrade_recovery)
    }

    #[test]
    fn test_upgrade_recovery() -> anyhow::Result<()> {
        let (h, config) = installed()?;
        let runs = h.hooks.runs().len();
        run_upgrade_recovery(&h, &config)?;

        let recovery = h.mountpoint(PartitionRole::Recovery);
        assert_eq!(
            std::fs::read_to_string(recovery.join("recovery.img"))?,
            "oci://registry.example.com/recovery:v2"
        );
        let ledger = h.ledger().unwrap();
        let rec = ledger.recovery_image().unwrap();
        assert_eq!(rec.source.to_string(), "oci://registry.example.com/recovery:v2");
        assert_eq!(rec.from_action, Some(FromAction::UpgradeRecovery));
        assert!(!rec.digest.is_empty());
        assert_eq!(h.ledger_snapshots(), [(1, true)]);
        assert_eq!(h.mirror().unwrap(), ledger);
        // No hooks, no power action
        assert_eq!(h.hooks.runs().len(), runs);
        assert_eq!(h.power.actions(), ["reboot"]);
        Ok(())
    }

    #[test]
    fn test_upgrade_recovery_keeps_state() -> anyhow::Result<()> {
        let (h, mut config) = installed()?;
        config.upgrade_recovery.update_install_state = false;
        let before = h.ledger();
        let calls = h.mounter.calls().len();
        run_upgrade_recovery(&h, &config)?;
        assert_eq!(h.ledger(), before);
        // Only the recovery partition was touched
        let r = h.root.as_str();
        assert_eq!(
            h.mounter.calls()[calls..],
            [
                format!("mount /dev/disk/by-label/COS_RECOVERY {r}/recovery ext4 rw"),
                format!("unmount {r}/recovery"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_upgrade_recovery_image_failure() -> anyhow::Result<()> {
        let (h, config) = installed()?;
        let recovery = h.mountpoint(PartitionRole::Recovery);
        let image = std::fs::read(recovery.join("recovery.img"))?;
        let before = h.ledger();
        h.maker.fail_fs("squashfs");
        let e = run_upgrade_recovery(&h, &config).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::DeployImage);
        assert_eq!(std::fs::read(recovery.join("recovery.img"))?, image);
        assert!(recovery.join("boot/vmlinuz").is_file());
        assert!(!recovery.join("transition.img").exists());
        assert!(!recovery.join("boot.transition").exists());
        assert_eq!(h.ledger(), before);
        Ok(())
    }

    #[test]
    fn test_upgrade_recovery_refused() -> anyhow::Result<()> {
        let (h, mut config) = installed()?;
        let booted = BootedSystem {
            from_recovery: true,
            snapshot: None,
        };
        let e = run_action(&h, &config, booted, upgrade_recovery).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::UpgradeRecoveryFromRecovery);

        config.upgrade_recovery.recovery_system = None;
        let e = run_upgrade_recovery(&h, &config).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidConfig);
        Ok(())
    }
}
