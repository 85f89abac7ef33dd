//! Snapshots stored as filesystem image files on the state partition.
//!
//! Layout below the state partition mountpoint:
//!
//! ```text
//! .snapshots/
//!   active -> 3/snapshot.img
//!   passives/2 -> ../2/snapshot.img
//!   2/snapshot.img
//!   3/snapshot.img
//!   4/snapshot.workDir    (open transaction)
//!   last_id               (highest id ever handed out)
//! ```
//!
//! The `active` symlink is the commit point: it is replaced with a rename.
//! Ids only grow; one that was rolled back is never handed out again.

use std::io::ErrorKind;
use std::rc::Rc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use super::{
    LOOPDEVICE, SNAPSHOTS_DIR, SYSTEM_LABEL, Snapshot, SnapshotterConfig, Snapshotter,
    boot_variables, next_id, numbered_dirs, remove_dir_if_exists, remove_file_if_exists,
    retention_victims,
};
use crate::bootloader::{Bootloader, GRUB_OEM_ENV};
use crate::image::{ImageMaker, ImageSpec};
use crate::source::ImageSource;

const ACTIVE_LINK: &str = "active";
const ACTIVE_TMP_LINK: &str = "active.tmp";
const PASSIVES_DIR: &str = "passives";
const IMAGE_FILE: &str = "snapshot.img";
const WORK_DIR: &str = "snapshot.workDir";

#[derive(Debug)]
pub(crate) struct LoopDevice {
    config: SnapshotterConfig,
    bootloader: Rc<dyn Bootloader>,
    maker: Rc<dyn ImageMaker>,
    /// The snapshot the running system booted from, if known.
    booted: Option<u32>,
    root: Option<Utf8PathBuf>,
    efi_dir: Utf8PathBuf,
    active: Option<u32>,
    open: Option<u32>,
}

/// Parse a symlink target of the form `<id>/snapshot.img`.
fn parse_link_target(target: &Utf8Path) -> Option<u32> {
    let mut components = target.components().map(|c| c.as_str());
    let id = components.next()?.parse().ok()?;
    (components.next() == Some(IMAGE_FILE) && components.next().is_none()).then_some(id)
}

impl LoopDevice {
    pub(crate) fn new(
        config: SnapshotterConfig,
        bootloader: Rc<dyn Bootloader>,
        maker: Rc<dyn ImageMaker>,
        booted: Option<u32>,
    ) -> Self {
        Self {
            config,
            bootloader,
            maker,
            booted,
            root: None,
            efi_dir: Utf8PathBuf::new(),
            active: None,
            open: None,
        }
    }

    fn root(&self) -> Result<&Utf8Path> {
        self.root
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Snapshotter is not initialized"))
    }

    fn snapshot_dirs(&self) -> Result<Vec<u32>> {
        numbered_dirs(self.root()?)
    }

    fn read_active(root: &Utf8Path) -> Result<Option<u32>> {
        let link = root.join(ACTIVE_LINK);
        let target = match link.read_link_utf8() {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Reading {link}")),
        };
        let id = parse_link_target(&target)
            .ok_or_else(|| anyhow::anyhow!("Unexpected target of {link}: {target}"))?;
        Ok(Some(id))
    }

    /// Atomically point `active` at snapshot `id`, or remove it.
    #[context("Setting active snapshot")]
    fn set_active(&mut self, id: Option<u32>) -> Result<()> {
        let root = self.root()?.to_owned();
        let link = root.join(ACTIVE_LINK);
        match id {
            Some(id) => {
                let tmp = root.join(ACTIVE_TMP_LINK);
                remove_file_if_exists(&tmp)?;
                let target = format!("{id}/{IMAGE_FILE}");
                std::os::unix::fs::symlink(&target, &tmp)
                    .with_context(|| format!("Linking {tmp}"))?;
                std::fs::rename(&tmp, &link).with_context(|| format!("Renaming to {link}"))?;
            }
            None => remove_file_if_exists(&link)?,
        }
        self.active = id;
        Ok(())
    }

    /// Rebuild the passive links and the bootloader variables from the
    /// committed snapshots.
    #[context("Publishing snapshots")]
    fn publish(&self) -> Result<()> {
        let root = self.root()?;
        let passives_dir = root.join(PASSIVES_DIR);
        remove_dir_if_exists(&passives_dir)?;
        std::fs::create_dir_all(&passives_dir)
            .with_context(|| format!("Creating {passives_dir}"))?;
        let passives: Vec<u32> = self
            .get_snapshots()?
            .into_iter()
            .filter(|id| Some(*id) != self.active)
            .collect();
        for id in &passives {
            let link = passives_dir.join(id.to_string());
            std::os::unix::fs::symlink(format!("../{id}/{IMAGE_FILE}"), &link)
                .with_context(|| format!("Linking {link}"))?;
        }
        let vars = boot_variables(LOOPDEVICE, &passives);
        self.bootloader
            .set_persistent_variables(&self.efi_dir.join(GRUB_OEM_ENV), &vars)
    }

    /// Delete the oldest snapshots beyond the retention limit, never the
    /// active or booted one.
    fn enforce_retention(&mut self) -> Result<()> {
        let max = self.config.max_snaps;
        let snaps = self.get_snapshots()?;
        for id in retention_victims(&snaps, max, [self.active, self.booted]) {
            tracing::info!("Deleting snapshot {id}: retention limit is {max}");
            self.delete_snapshot(id)?;
        }
        Ok(())
    }

    /// Remove a failed snapshot and forget the open transaction.
    fn drop_snapshot(&mut self, snap: &Snapshot) {
        if self.open == Some(snap.id) {
            self.open = None;
        }
        if self.active == Some(snap.id) {
            tracing::warn!("Not dropping active snapshot {}", snap.id);
            return;
        }
        if let Err(e) = remove_dir_if_exists(&snap.path) {
            tracing::warn!("Dropping snapshot {}: {e:#}", snap.id);
        }
    }

    fn commit(&mut self, snap: &Snapshot) -> Result<()> {
        let image = snap.path.join(IMAGE_FILE);
        let spec = ImageSpec {
            label: SYSTEM_LABEL.to_owned(),
            fs: self.config.config.fs.clone(),
            size_mib: self.config.config.size,
        };
        self.maker.make(&snap.work_dir, &image, &spec)?;
        remove_dir_if_exists(&snap.work_dir)?;

        let previous = self.active;
        self.set_active(Some(snap.id))?;
        self.open = None;
        if let Err(e) = self.publish() {
            tracing::warn!("Restoring active snapshot {previous:?}");
            if let Err(restore) = self.set_active(previous) {
                // `active` still names this snapshot, so it has to stay
                tracing::error!("Restoring active snapshot: {restore:#}");
                return Err(e.context(format!("Snapshot {} stays active", snap.id)));
            }
            remove_dir_if_exists(&snap.path)?;
            if let Err(e) = self.publish() {
                tracing::warn!("Republishing snapshots: {e:#}");
            }
            return Err(e);
        }
        Ok(())
    }
}

impl Snapshotter for LoopDevice {
    #[context("Initializing snapshotter")]
    fn init(&mut self, state_dir: &Utf8Path, efi_dir: &Utf8Path) -> Result<()> {
        let root = state_dir.join(SNAPSHOTS_DIR);
        std::fs::create_dir_all(root.join(PASSIVES_DIR))
            .with_context(|| format!("Creating {root}"))?;
        self.active = Self::read_active(&root)?;
        self.root = Some(root);
        self.efi_dir = efi_dir.to_owned();
        self.open = None;
        if self.booted.is_none() {
            self.booted = self.active;
        }
        let root = self.root()?.to_owned();
        for id in self.snapshot_dirs()? {
            let dir = root.join(id.to_string());
            if !dir.join(IMAGE_FILE).try_exists()? {
                tracing::info!("Reclaiming incomplete snapshot {id}");
                remove_dir_if_exists(&dir)?;
            }
        }
        tracing::debug!("Snapshotter ready, active snapshot: {:?}", self.active);
        Ok(())
    }

    #[context("Starting transaction")]
    fn start_transaction(&mut self) -> Result<Snapshot> {
        if let Some(id) = self.open {
            anyhow::bail!("Transaction for snapshot {id} is already open");
        }
        let root = self.root()?.to_owned();
        let id = next_id(&root, self.snapshot_dirs()?.last().copied())?;
        let path = root.join(id.to_string());
        let work_dir = path.join(WORK_DIR);
        std::fs::create_dir_all(&work_dir).with_context(|| format!("Creating {work_dir}"))?;
        self.open = Some(id);
        tracing::info!("Started transaction for snapshot {id}");
        Ok(Snapshot { id, path, work_dir })
    }

    #[context("Closing transaction for snapshot {}", snap.id)]
    fn close_transaction(&mut self, snap: &Snapshot) -> Result<()> {
        if self.open != Some(snap.id) {
            if !snap.path.join(IMAGE_FILE).try_exists()? {
                self.drop_snapshot(snap);
            }
            anyhow::bail!("Snapshot {} is not the open transaction", snap.id);
        }
        if let Err(e) = self.commit(snap) {
            self.drop_snapshot(snap);
            return Err(e);
        }
        tracing::info!("Snapshot {} is now active", snap.id);
        if let Err(e) = self.enforce_retention() {
            tracing::warn!("Enforcing snapshot retention: {e:#}");
        }
        Ok(())
    }

    fn close_transaction_on_error(&mut self, snap: &Snapshot) -> Result<()> {
        if self.open != Some(snap.id) {
            tracing::debug!("Snapshot {} is not in progress, keeping it", snap.id);
            return Ok(());
        }
        tracing::info!("Rolling back snapshot {}", snap.id);
        self.open = None;
        remove_dir_if_exists(&snap.path)
    }

    #[context("Deleting snapshot {id}")]
    fn delete_snapshot(&mut self, id: u32) -> Result<()> {
        if Some(id) == self.active {
            anyhow::bail!("Refusing to delete the active snapshot");
        }
        if Some(id) == self.booted {
            anyhow::bail!("Refusing to delete the booted snapshot");
        }
        let dir = self.root()?.join(id.to_string());
        if !dir.try_exists()? {
            tracing::info!("Snapshot {id} does not exist, nothing to delete");
            return Ok(());
        }
        remove_dir_if_exists(&dir)?;
        self.publish()
    }

    fn get_snapshots(&self) -> Result<Vec<u32>> {
        let root = self.root()?;
        let mut r = Vec::new();
        for id in self.snapshot_dirs()? {
            if root.join(id.to_string()).join(IMAGE_FILE).try_exists()? {
                r.push(id);
            }
        }
        Ok(r)
    }

    fn snapshot_to_image_source(&self, snap: &Snapshot) -> Result<ImageSource> {
        let image = snap.path.join(IMAGE_FILE);
        if !image.try_exists()? {
            anyhow::bail!("Snapshot {} has no image at {image}", snap.id);
        }
        Ok(ImageSource::file(image))
    }

    fn kind(&self) -> &'static str {
        LOOPDEVICE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshotter::LAST_ID_FILE;
    use crate::testutil::{FakeBootloader, FakeImageMaker};

    struct Fixture {
        _td: tempfile::TempDir,
        state: Utf8PathBuf,
        efi: Utf8PathBuf,
        bootloader: FakeBootloader,
        maker: FakeImageMaker,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let td = tempfile::tempdir()?;
            let root = Utf8Path::from_path(td.path()).unwrap().to_owned();
            let state = root.join("state");
            let efi = root.join("efi");
            std::fs::create_dir_all(&state)?;
            std::fs::create_dir_all(&efi)?;
            Ok(Self {
                _td: td,
                state,
                efi,
                bootloader: FakeBootloader::default(),
                maker: FakeImageMaker::default(),
            })
        }

        fn snapshotter(&self, max_snaps: u32) -> Result<LoopDevice> {
            let config = SnapshotterConfig {
                max_snaps,
                ..Default::default()
            };
            let mut l = LoopDevice::new(
                config,
                Rc::new(self.bootloader.clone()),
                Rc::new(self.maker.clone()),
                None,
            );
            l.init(&self.state, &self.efi)?;
            Ok(l)
        }

        fn snapshots_dir(&self) -> Utf8PathBuf {
            self.state.join(SNAPSHOTS_DIR)
        }
    }

    fn commit_one(l: &mut LoopDevice) -> Result<Snapshot> {
        let snap = l.start_transaction()?;
        std::fs::write(snap.work_dir.join("os-release"), format!("{}", snap.id))?;
        l.close_transaction(&snap)?;
        Ok(snap)
    }

    #[test]
    fn test_parse_link_target() {
        assert_eq!(parse_link_target(Utf8Path::new("3/snapshot.img")), Some(3));
        assert_eq!(parse_link_target(Utf8Path::new("3/other")), None);
        assert_eq!(parse_link_target(Utf8Path::new("x/snapshot.img")), None);
        assert_eq!(parse_link_target(Utf8Path::new("3/snapshot.img/x")), None);
    }

    #[test]
    fn test_transaction_commit() -> Result<()> {
        let f = Fixture::new()?;
        let mut l = f.snapshotter(4)?;
        assert!(f.snapshots_dir().join(PASSIVES_DIR).is_dir());
        assert_eq!(l.get_snapshots()?, Vec::<u32>::new());

        let snap = l.start_transaction()?;
        assert_eq!(snap.id, 1);
        assert!(snap.work_dir.is_dir());
        assert!(l.start_transaction().is_err());
        l.close_transaction(&snap)?;

        assert!(!snap.work_dir.exists());
        assert_eq!(l.get_snapshots()?, [1]);
        assert_eq!(LoopDevice::read_active(&f.snapshots_dir())?, Some(1));
        assert_eq!(
            f.maker.images(),
            [(snap.path.join(IMAGE_FILE), SYSTEM_LABEL.to_owned())]
        );
        let vars = f.bootloader.vars(&f.efi.join(GRUB_OEM_ENV));
        assert_eq!(vars["fallback"], "0 1");

        let snap2 = commit_one(&mut l)?;
        assert_eq!(snap2.id, 2);
        assert_eq!(
            f.snapshots_dir().join("passives/1").read_link_utf8()?,
            "../1/snapshot.img"
        );
        let vars = f.bootloader.vars(&f.efi.join(GRUB_OEM_ENV));
        assert_eq!(vars["passive_snaps"], "1");
        assert_eq!(
            l.snapshot_to_image_source(&snap2)?.to_string(),
            format!("file://{}/2/snapshot.img", f.snapshots_dir())
        );
        // Committed snapshots survive a late rollback request
        l.close_transaction_on_error(&snap2)?;
        assert_eq!(l.get_snapshots()?, [1, 2]);
        Ok(())
    }

    #[test]
    fn test_rollback() -> Result<()> {
        let f = Fixture::new()?;
        let mut l = f.snapshotter(4)?;
        commit_one(&mut l)?;
        let snap = l.start_transaction()?;
        l.close_transaction_on_error(&snap)?;
        assert!(!snap.path.exists());
        assert_eq!(l.get_snapshots()?, [1]);
        assert_eq!(LoopDevice::read_active(&f.snapshots_dir())?, Some(1));
        assert!(l.snapshot_to_image_source(&snap).is_err());
        // A new transaction can be opened again, with a fresh id
        let snap = l.start_transaction()?;
        assert_eq!(snap.id, 3);
        l.close_transaction(&snap)?;
        assert_eq!(l.get_snapshots()?, [1, 3]);
        Ok(())
    }

    #[test]
    fn test_close_not_open() -> Result<()> {
        let f = Fixture::new()?;
        let mut l = f.snapshotter(4)?;
        let snap = l.start_transaction()?;
        l.close_transaction_on_error(&snap)?;
        std::fs::create_dir_all(&snap.work_dir)?;
        assert!(l.close_transaction(&snap).is_err());
        assert!(!snap.path.exists());
        Ok(())
    }

    #[test]
    fn test_init_reclaims_incomplete() -> Result<()> {
        let f = Fixture::new()?;
        let mut l = f.snapshotter(4)?;
        commit_one(&mut l)?;
        // Simulate a crash with an open transaction
        let crashed = l.start_transaction()?;
        drop(l);

        let mut l = f.snapshotter(4)?;
        assert!(!crashed.path.exists());
        assert_eq!(l.get_snapshots()?, [1]);
        assert_eq!(l.active, Some(1));
        assert_eq!(l.booted, Some(1));
        assert_eq!(commit_one(&mut l)?.id, crashed.id + 1);
        Ok(())
    }

    #[test]
    fn test_ids_never_reused() -> Result<()> {
        let f = Fixture::new()?;
        let mut l = f.snapshotter(1)?;
        for _ in 0..3 {
            commit_one(&mut l)?;
        }
        // Retention left only the newest one
        assert_eq!(l.get_snapshots()?, [3]);
        let snap = l.start_transaction()?;
        assert_eq!(snap.id, 4);
        l.close_transaction_on_error(&snap)?;
        assert_eq!(
            std::fs::read_to_string(f.snapshots_dir().join(LAST_ID_FILE))?,
            "4"
        );

        // A corrupt marker is an error rather than a silent restart at 1
        std::fs::write(f.snapshots_dir().join(LAST_ID_FILE), "garbage")?;
        assert!(l.start_transaction().is_err());
        Ok(())
    }

    #[test]
    fn test_image_failure_keeps_active() -> Result<()> {
        let f = Fixture::new()?;
        let mut l = f.snapshotter(4)?;
        commit_one(&mut l)?;
        f.maker.fail(true);
        let snap = l.start_transaction()?;
        let e = l.close_transaction(&snap).unwrap_err();
        assert!(format!("{e:#}").contains("Closing transaction for snapshot 2"));
        assert!(!snap.path.exists());
        assert_eq!(LoopDevice::read_active(&f.snapshots_dir())?, Some(1));
        assert_eq!(l.get_snapshots()?, [1]);
        Ok(())
    }

    #[test]
    fn test_bootloader_failure_reverts() -> Result<()> {
        let f = Fixture::new()?;
        let mut l = f.snapshotter(4)?;
        commit_one(&mut l)?;
        f.bootloader.fail_variables(true);
        let snap = l.start_transaction()?;
        assert!(l.close_transaction(&snap).is_err());
        assert_eq!(LoopDevice::read_active(&f.snapshots_dir())?, Some(1));
        assert_eq!(l.get_snapshots()?, [1]);
        assert!(!snap.path.exists());
        Ok(())
    }

    #[test]
    fn test_retention() -> Result<()> {
        let f = Fixture::new()?;
        let mut l = f.snapshotter(2)?;
        for _ in 0..3 {
            commit_one(&mut l)?;
        }
        assert_eq!(l.get_snapshots()?, [2, 3]);
        assert!(!f.snapshots_dir().join("1").exists());
        assert!(!f.snapshots_dir().join("passives/1").exists());
        let vars = f.bootloader.vars(&f.efi.join(GRUB_OEM_ENV));
        assert_eq!(vars["passive_snaps"], "2");
        Ok(())
    }

    #[test]
    fn test_retention_keeps_booted() -> Result<()> {
        let f = Fixture::new()?;
        let mut l = f.snapshotter(4)?;
        commit_one(&mut l)?;
        commit_one(&mut l)?;
        // Booted from 1, now active is 2
        let config = SnapshotterConfig {
            max_snaps: 1,
            ..Default::default()
        };
        let mut l = LoopDevice::new(
            config,
            Rc::new(f.bootloader.clone()),
            Rc::new(f.maker.clone()),
            Some(1),
        );
        l.init(&f.state, &f.efi)?;
        commit_one(&mut l)?;
        assert_eq!(l.get_snapshots()?, [1, 3]);
        Ok(())
    }

    #[test]
    fn test_delete_snapshot() -> Result<()> {
        let f = Fixture::new()?;
        let mut l = f.snapshotter(4)?;
        for _ in 0..3 {
            commit_one(&mut l)?;
        }
        let mut l = LoopDevice::new(
            SnapshotterConfig::default(),
            Rc::new(f.bootloader.clone()),
            Rc::new(f.maker.clone()),
            Some(1),
        );
        l.init(&f.state, &f.efi)?;
        // 1 is booted, 3 is active
        assert!(l.delete_snapshot(3).is_err());
        assert!(l.delete_snapshot(1).is_err());
        l.delete_snapshot(2)?;
        l.delete_snapshot(7)?;
        assert_eq!(l.get_snapshots()?, [1, 3]);
        assert!(!f.snapshots_dir().join("passives/2").exists());
        Ok(())
    }

    #[test]
    fn test_uninitialized() {
        let l = LoopDevice::new(
            SnapshotterConfig::default(),
            Rc::new(FakeBootloader::default()),
            Rc::new(FakeImageMaker::default()),
            None,
        );
        assert!(l.get_snapshots().is_err());
    }
}
