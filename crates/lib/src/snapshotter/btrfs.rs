//! Snapshots stored as btrfs subvolumes of the state partition.
//!
//! Layout below the state partition mountpoint, the top level subvolume:
//!
//! ```text
//! @/                       subvolume
//! @/.snapshots/            subvolume
//!   last_id
//!   2/snapshot             read-only subvolume
//!   3/snapshot             read-only subvolume, the filesystem default
//!   4/snapshot             open transaction
//!   4/in_progress
//! ```
//!
//! The default subvolume of the filesystem is the commit point. Every
//! transaction after the first starts as a writable snapshot of the
//! active one.

use std::collections::BTreeMap;
use std::fmt;
use std::process::Command;
use std::rc::Rc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use snapos_utils::CommandRunExt;

use super::{
    BTRFS, SNAPSHOTS_DIR, Snapshot, SnapshotterConfig, Snapshotter, boot_variables, next_id,
    numbered_dirs, remove_dir_if_exists, remove_file_if_exists, retention_victims,
};
use crate::bootloader::{Bootloader, GRUB_OEM_ENV};
use crate::source::ImageSource;

const ROOT_SUBVOL: &str = "@";
const SNAPSHOT_SUBVOL: &str = "snapshot";
/// Present next to a snapshot subvolume until it is committed.
const IN_PROGRESS: &str = "in_progress";
/// The top level subvolume, default of a fresh filesystem.
const TOP_LEVEL_ID: u64 = 5;

/// One entry of `btrfs subvolume list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Subvolume {
    pub(crate) id: u64,
    /// Relative to the top level subvolume.
    pub(crate) path: String,
}

/// The btrfs operations backing [`Btrfs`].
pub(crate) trait BtrfsTool: fmt::Debug {
    /// Every subvolume of the filesystem mounted at `root`, sorted by path.
    fn list(&self, root: &Utf8Path) -> Result<Vec<Subvolume>>;
    /// The default subvolume, `None` while it is the top level one.
    fn get_default(&self, root: &Utf8Path) -> Result<Option<Subvolume>>;
    fn set_default(&self, id: u64, root: &Utf8Path) -> Result<()>;
    fn create(&self, path: &Utf8Path) -> Result<()>;
    /// Create a writable snapshot of `source` at `target`.
    fn snapshot(&self, source: &Utf8Path, target: &Utf8Path) -> Result<()>;
    fn set_read_only(&self, path: &Utf8Path) -> Result<()>;
    fn delete(&self, path: &Utf8Path) -> Result<()>;
}

/// Drives the `btrfs` command line tool.
#[derive(Debug, Default)]
pub(crate) struct BtrfsCli;

fn command(args: &[&str]) -> Command {
    let mut cmd = Command::new("btrfs");
    cmd.args(args);
    cmd
}

/// Parse the output of `btrfs subvolume list` and `get-default`:
/// `ID 259 gen 12 top level 257 path @/.snapshots/1/snapshot`.
fn parse_subvolumes(out: &str) -> Vec<Subvolume> {
    out.lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("ID ")?;
            let (id, rest) = rest.split_once(' ')?;
            let (_, path) = rest.split_once(" path ")?;
            Some(Subvolume {
                id: id.parse().ok()?,
                path: path.to_owned(),
            })
        })
        .collect()
}

/// The snapshot id of a subvolume path `@/.snapshots/<id>/snapshot`.
fn snapshot_id(path: &str) -> Option<u32> {
    let rest = path
        .strip_prefix(ROOT_SUBVOL)?
        .strip_prefix('/')?
        .strip_prefix(SNAPSHOTS_DIR)?
        .strip_prefix('/')?;
    let (id, name) = rest.split_once('/')?;
    (name == SNAPSHOT_SUBVOL).then(|| id.parse().ok()).flatten()
}

impl BtrfsTool for BtrfsCli {
    fn list(&self, root: &Utf8Path) -> Result<Vec<Subvolume>> {
        let out = command(&["subvolume", "list", "--sort=path", root.as_str()])
            .log_debug()
            .run_get_string()?;
        Ok(parse_subvolumes(&out))
    }

    fn get_default(&self, root: &Utf8Path) -> Result<Option<Subvolume>> {
        let out = command(&["subvolume", "get-default", root.as_str()])
            .log_debug()
            .run_get_string()?;
        Ok(parse_subvolumes(&out).into_iter().next())
    }

    fn set_default(&self, id: u64, root: &Utf8Path) -> Result<()> {
        command(&["subvolume", "set-default", &id.to_string(), root.as_str()])
            .log_debug()
            .run_capture_stderr()
    }

    fn create(&self, path: &Utf8Path) -> Result<()> {
        command(&["subvolume", "create", path.as_str()])
            .log_debug()
            .run_capture_stderr()
    }

    fn snapshot(&self, source: &Utf8Path, target: &Utf8Path) -> Result<()> {
        command(&["subvolume", "snapshot", source.as_str(), target.as_str()])
            .log_debug()
            .run_capture_stderr()
    }

    fn set_read_only(&self, path: &Utf8Path) -> Result<()> {
        command(&["property", "set", path.as_str(), "ro", "true"])
            .log_debug()
            .run_capture_stderr()
    }

    fn delete(&self, path: &Utf8Path) -> Result<()> {
        command(&["subvolume", "delete", path.as_str()])
            .log_debug()
            .run_capture_stderr()
    }
}

#[derive(Debug)]
pub(crate) struct Btrfs {
    config: SnapshotterConfig,
    bootloader: Rc<dyn Bootloader>,
    tool: Rc<dyn BtrfsTool>,
    /// The snapshot the running system booted from, if known.
    booted: Option<u32>,
    state_dir: Option<Utf8PathBuf>,
    efi_dir: Utf8PathBuf,
    active: Option<u32>,
    open: Option<u32>,
}

impl Btrfs {
    pub(crate) fn new(
        config: SnapshotterConfig,
        bootloader: Rc<dyn Bootloader>,
        tool: Rc<dyn BtrfsTool>,
        booted: Option<u32>,
    ) -> Self {
        Self {
            config,
            bootloader,
            tool,
            booted,
            state_dir: None,
            efi_dir: Utf8PathBuf::new(),
            active: None,
            open: None,
        }
    }

    fn state_dir(&self) -> Result<&Utf8Path> {
        self.state_dir
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Snapshotter is not initialized"))
    }

    fn root(&self) -> Result<Utf8PathBuf> {
        Ok(self.state_dir()?.join(ROOT_SUBVOL).join(SNAPSHOTS_DIR))
    }

    fn subvolume_path(&self, id: u32) -> Result<Utf8PathBuf> {
        Ok(self.root()?.join(id.to_string()).join(SNAPSHOT_SUBVOL))
    }

    fn in_progress(&self, id: u32) -> Result<bool> {
        let marker = self.root()?.join(id.to_string()).join(IN_PROGRESS);
        Ok(marker.try_exists()?)
    }

    /// Snapshot subvolumes, committed or not, by snapshot id.
    fn snapshot_subvolumes(&self) -> Result<BTreeMap<u32, Subvolume>> {
        let subvols = self.tool.list(self.state_dir()?)?;
        Ok(subvols
            .into_iter()
            .filter_map(|s| Some((snapshot_id(&s.path)?, s)))
            .collect())
    }

    fn read_active(&self) -> Result<Option<u32>> {
        let default = self.tool.get_default(self.state_dir()?)?;
        Ok(default.and_then(|s| snapshot_id(&s.path)))
    }

    /// Make snapshot `id` the default subvolume, or fall back to the top
    /// level one.
    #[context("Setting active snapshot")]
    fn set_active(&mut self, id: Option<u32>) -> Result<()> {
        let subvol = match id {
            Some(id) => {
                self.snapshot_subvolumes()?
                    .get(&id)
                    .ok_or_else(|| anyhow::anyhow!("No subvolume for snapshot {id}"))?
                    .id
            }
            None => TOP_LEVEL_ID,
        };
        self.tool.set_default(subvol, self.state_dir()?)?;
        self.active = id;
        Ok(())
    }

    #[context("Publishing snapshots")]
    fn publish(&self) -> Result<()> {
        let passives: Vec<u32> = self
            .get_snapshots()?
            .into_iter()
            .filter(|id| Some(*id) != self.active)
            .collect();
        let vars = boot_variables(BTRFS, &passives);
        self.bootloader
            .set_persistent_variables(&self.efi_dir.join(GRUB_OEM_ENV), &vars)
    }

    fn enforce_retention(&mut self) -> Result<()> {
        let max = self.config.max_snaps;
        let snaps = self.get_snapshots()?;
        for id in retention_victims(&snaps, max, [self.active, self.booted]) {
            tracing::info!("Deleting snapshot {id}: retention limit is {max}");
            self.delete_snapshot(id)?;
        }
        Ok(())
    }

    /// Delete the subvolume of snapshot `id` and its directory.
    fn remove_snapshot(&self, id: u32) -> Result<()> {
        let subvol = self.subvolume_path(id)?;
        if subvol.try_exists()? {
            self.tool.delete(&subvol)?;
        }
        remove_dir_if_exists(&self.root()?.join(id.to_string()))
    }

    fn drop_snapshot(&mut self, snap: &Snapshot) {
        if self.open == Some(snap.id) {
            self.open = None;
        }
        if self.active == Some(snap.id) {
            tracing::warn!("Not dropping active snapshot {}", snap.id);
            return;
        }
        if let Err(e) = self.remove_snapshot(snap.id) {
            tracing::warn!("Dropping snapshot {}: {e:#}", snap.id);
        }
    }

    fn commit(&mut self, snap: &Snapshot) -> Result<()> {
        self.tool.set_read_only(&snap.work_dir)?;
        let previous = self.active;
        self.set_active(Some(snap.id))?;
        self.open = None;
        remove_file_if_exists(&snap.path.join(IN_PROGRESS))?;
        if let Err(e) = self.publish() {
            tracing::warn!("Restoring active snapshot {previous:?}");
            if let Err(restore) = self.set_active(previous) {
                // Still the default subvolume, so it has to stay
                tracing::error!("Restoring active snapshot: {restore:#}");
                return Err(e.context(format!("Snapshot {} stays active", snap.id)));
            }
            self.remove_snapshot(snap.id)?;
            if let Err(e) = self.publish() {
                tracing::warn!("Republishing snapshots: {e:#}");
            }
            return Err(e);
        }
        Ok(())
    }
}

impl Snapshotter for Btrfs {
    #[context("Initializing btrfs snapshotter")]
    fn init(&mut self, state_dir: &Utf8Path, efi_dir: &Utf8Path) -> Result<()> {
        let subvols = self.tool.list(state_dir)?;
        for name in [ROOT_SUBVOL.to_owned(), format!("{ROOT_SUBVOL}/{SNAPSHOTS_DIR}")] {
            if !subvols.iter().any(|s| s.path == name) {
                tracing::info!("Creating subvolume {name}");
                self.tool.create(&state_dir.join(&name))?;
            }
        }
        self.state_dir = Some(state_dir.to_owned());
        self.efi_dir = efi_dir.to_owned();
        self.open = None;
        self.active = self.read_active()?;
        if self.booted.is_none() {
            self.booted = self.active;
        }

        let root = self.root()?;
        let subvols = self.snapshot_subvolumes()?;
        for id in numbered_dirs(&root)? {
            let in_progress = self.in_progress(id)?;
            if Some(id) == self.active {
                if in_progress {
                    tracing::info!("Completing commit of snapshot {id}");
                    remove_file_if_exists(&root.join(id.to_string()).join(IN_PROGRESS))?;
                }
                continue;
            }
            if in_progress || !subvols.contains_key(&id) {
                tracing::info!("Reclaiming incomplete snapshot {id}");
                self.remove_snapshot(id)?;
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
        let root = self.root()?;
        let id = next_id(&root, numbered_dirs(&root)?.last().copied())?;
        let path = root.join(id.to_string());
        std::fs::create_dir_all(&path).with_context(|| format!("Creating {path}"))?;
        std::fs::write(path.join(IN_PROGRESS), "").with_context(|| format!("Marking {path}"))?;
        let work_dir = path.join(SNAPSHOT_SUBVOL);
        let r = match self.active {
            Some(active) => self.tool.snapshot(&self.subvolume_path(active)?, &work_dir),
            None => self.tool.create(&work_dir),
        };
        if let Err(e) = r {
            if let Err(e) = self.remove_snapshot(id) {
                tracing::warn!("Removing snapshot {id}: {e:#}");
            }
            return Err(e);
        }
        self.open = Some(id);
        tracing::info!("Started transaction for snapshot {id} from {:?}", self.active);
        Ok(Snapshot { id, path, work_dir })
    }

    #[context("Closing transaction for snapshot {}", snap.id)]
    fn close_transaction(&mut self, snap: &Snapshot) -> Result<()> {
        if self.open != Some(snap.id) {
            if self.in_progress(snap.id)? {
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
        self.remove_snapshot(snap.id)
    }

    #[context("Deleting snapshot {id}")]
    fn delete_snapshot(&mut self, id: u32) -> Result<()> {
        if Some(id) == self.active {
            anyhow::bail!("Refusing to delete the active snapshot");
        }
        if Some(id) == self.booted {
            anyhow::bail!("Refusing to delete the booted snapshot");
        }
        if !self.root()?.join(id.to_string()).try_exists()? {
            tracing::info!("Snapshot {id} does not exist, nothing to delete");
            return Ok(());
        }
        self.remove_snapshot(id)?;
        self.publish()
    }

    fn get_snapshots(&self) -> Result<Vec<u32>> {
        let mut r = Vec::new();
        for id in self.snapshot_subvolumes()?.into_keys() {
            if !self.in_progress(id)? {
                r.push(id);
            }
        }
        Ok(r)
    }

    fn snapshot_to_image_source(&self, snap: &Snapshot) -> Result<ImageSource> {
        if !snap.work_dir.try_exists()? {
            anyhow::bail!("Snapshot {} has no subvolume at {}", snap.id, snap.work_dir);
        }
        Ok(ImageSource::dir(snap.work_dir.clone()))
    }

    fn kind(&self) -> &'static str {
        BTRFS
    }
}
