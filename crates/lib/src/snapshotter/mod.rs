//! Numbered, independently bootable root filesystem snapshots.
//!
//! A snapshotter owns the on-disk snapshot area of the state partition.
//! Each transaction allocates one snapshot, which the caller populates
//! through its work directory and then commits or rolls back:
//!
//! ```text
//! Idle -> Open (start_transaction) -> Committed (close_transaction)
//!                                  -> RolledBack (close_transaction_on_error)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{ambient_authority, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::source::ImageSource;

mod btrfs;
mod loopdevice;
#[cfg(test)]
pub(crate) use btrfs::Subvolume;
pub(crate) use btrfs::{Btrfs, BtrfsCli, BtrfsTool};
pub(crate) use loopdevice::LoopDevice;

/// Snapshots as image files attached through loop devices.
pub(crate) const LOOPDEVICE: &str = "loopdevice";
/// Snapshots as btrfs subvolumes of the state partition.
pub(crate) const BTRFS: &str = "btrfs";
/// Every snapshotter type we implement.
pub(crate) const KINDS: [&str; 2] = [LOOPDEVICE, BTRFS];
/// Filesystem label of every system image.
pub(crate) const SYSTEM_LABEL: &str = "COS_SYSTEM";

const DEFAULT_MAX_SNAPS: u32 = 4;
const DEFAULT_SIZE: u64 = 3072;
const DEFAULT_FS: &str = "ext4";

fn default_kind() -> String {
    LOOPDEVICE.to_owned()
}

fn default_max_snaps() -> u32 {
    DEFAULT_MAX_SNAPS
}

fn default_size() -> u64 {
    DEFAULT_SIZE
}

fn default_fs() -> String {
    DEFAULT_FS.to_owned()
}

/// Settings of the image files backing each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopDeviceConfig {
    /// Image size in MiB.
    #[serde(default = "default_size")]
    pub(crate) size: u64,
    /// Image filesystem.
    #[serde(default = "default_fs")]
    pub(crate) fs: String,
}

impl Default for LoopDeviceConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_SIZE,
            fs: default_fs(),
        }
    }
}

/// Snapshotter selection and settings; echoed into the install state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotterConfig {
    #[serde(rename = "type", default = "default_kind")]
    pub(crate) kind: String,
    /// How many snapshots to keep, including the active one.
    #[serde(default = "default_max_snaps")]
    pub(crate) max_snaps: u32,
    #[serde(default)]
    pub(crate) config: LoopDeviceConfig,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            max_snaps: DEFAULT_MAX_SNAPS,
            config: LoopDeviceConfig::default(),
        }
    }
}

/// Name of the snapshot area below the state partition root.
const SNAPSHOTS_DIR: &str = ".snapshots";
/// Highest snapshot id ever handed out, kept in the snapshot area.
const LAST_ID_FILE: &str = "last_id";

fn remove_dir_if_exists(p: &Utf8Path) -> Result<()> {
    match std::fs::remove_dir_all(p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Removing {p}")),
    }
}

fn remove_file_if_exists(p: &Utf8Path) -> Result<()> {
    match std::fs::remove_file(p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Removing {p}")),
    }
}

fn read_last_id(root: &Utf8Path) -> Result<u32> {
    let path = root.join(LAST_ID_FILE);
    match std::fs::read_to_string(&path) {
        Ok(buf) => buf
            .trim()
            .parse()
            .with_context(|| format!("Parsing {path}")),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e).with_context(|| format!("Reading {path}")),
    }
}

#[context("Recording snapshot id {id}")]
fn write_last_id(root: &Utf8Path, id: u32) -> Result<()> {
    let dir = Dir::open_ambient_dir(root, ambient_authority())
        .with_context(|| format!("Opening {root}"))?;
    dir.atomic_write(LAST_ID_FILE, id.to_string())?;
    Ok(())
}

/// Reserve the id following both the recorded high-water mark and
/// `newest`. Ids only grow; one that was rolled back is never handed
/// out again.
fn next_id(root: &Utf8Path, newest: Option<u32>) -> Result<u32> {
    let id = read_last_id(root)?.max(newest.unwrap_or(0)) + 1;
    // Recorded before anything is created, a crash must not recycle it
    write_last_id(root, id)?;
    Ok(id)
}

/// Numeric entries of the snapshot area `root`, ascending.
fn numbered_dirs(root: &Utf8Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in root.read_dir_utf8().with_context(|| format!("Reading {root}"))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Ok(id) = entry.file_name().parse::<u32>() {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// The oldest snapshots of `snaps` (ascending) to delete so that at most
/// `max` remain, never one listed in `keep`.
fn retention_victims(snaps: &[u32], max: u32, keep: [Option<u32>; 2]) -> Vec<u32> {
    let excess = snaps.len().saturating_sub(max as usize);
    snaps
        .iter()
        .copied()
        .filter(|id| !keep.contains(&Some(*id)))
        .take(excess)
        .collect()
}

/// The GRUB variables describing the snapshot set of a `kind` snapshotter.
fn boot_variables(kind: &str, passives: &[u32]) -> BTreeMap<String, String> {
    let mut passives = passives.to_vec();
    passives.sort_unstable_by(|a, b| b.cmp(a));
    let passive_snaps = passives
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    // Active entry, one per passive, then recovery
    let fallback = (0..=passives.len() + 1)
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    BTreeMap::from([
        ("passive_snaps".to_owned(), passive_snaps),
        ("fallback".to_owned(), fallback),
        ("snapshotter".to_owned(), kind.to_owned()),
    ])
}

/// A snapshot handed out by [`Snapshotter::start_transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub(crate) id: u32,
    /// The directory holding everything belonging to this snapshot.
    pub(crate) path: Utf8PathBuf,
    /// Where the caller deploys the root tree.
    pub(crate) work_dir: Utf8PathBuf,
}

pub(crate) trait Snapshotter: fmt::Debug {
    /// Prepare the snapshot area on the state partition mounted at
    /// `state_dir`; bootloader variables go to the EFI partition at
    /// `efi_dir`. Idempotent.
    fn init(&mut self, state_dir: &Utf8Path, efi_dir: &Utf8Path) -> Result<()>;

    /// Allocate the next snapshot.
    fn start_transaction(&mut self) -> Result<Snapshot>;

    /// Commit `snap` and make it the active snapshot. On failure the
    /// previously active snapshot stays active.
    fn close_transaction(&mut self, snap: &Snapshot) -> Result<()>;

    /// Drop `snap` if it is still the open transaction; committed
    /// snapshots are left alone.
    fn close_transaction_on_error(&mut self, snap: &Snapshot) -> Result<()>;

    /// Remove a committed snapshot other than the active or booted one.
    fn delete_snapshot(&mut self, id: u32) -> Result<()>;

    /// IDs of the committed snapshots, ascending.
    fn get_snapshots(&self) -> Result<Vec<u32>>;

    /// A source referencing the committed content of `snap`.
    fn snapshot_to_image_source(&self, snap: &Snapshot) -> Result<ImageSource>;

    /// The type recorded in the install state.
    fn kind(&self) -> &'static str;
}
