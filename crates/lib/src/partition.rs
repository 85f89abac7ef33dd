//! Partitions managed by the toolkit, and the mount/format seams.
//!
//! The partition set is discovered once at workflow start by looking up
//! filesystem labels; partitioning itself is out of our hands.

use std::fmt;
use std::process::Command;
use std::rc::Rc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};
use snapos_utils::CommandRunExt;

use crate::cleanup::CleanupStack;
use crate::error::{ActionError, ErrorKind};

/// The fixed set of partitions we know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionRole {
    /// The EFI system partition holding the bootloader.
    Efi,
    /// The partition holding the snapshots.
    State,
    /// The partition holding the recovery image.
    Recovery,
    /// Site configuration.
    Oem,
    /// Data preserved across resets.
    Persistent,
}

impl PartitionRole {
    pub(crate) const ALL: [PartitionRole; 5] = [
        PartitionRole::Efi,
        PartitionRole::Oem,
        PartitionRole::Recovery,
        PartitionRole::State,
        PartitionRole::Persistent,
    ];

    /// The key used in the install state ledger.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            PartitionRole::Efi => "efi",
            PartitionRole::State => "state",
            PartitionRole::Recovery => "recovery",
            PartitionRole::Oem => "oem",
            PartitionRole::Persistent => "persistent",
        }
    }

    pub(crate) fn default_label(&self) -> &'static str {
        match self {
            PartitionRole::Efi => "COS_GRUB",
            PartitionRole::State => "COS_STATE",
            PartitionRole::Recovery => "COS_RECOVERY",
            PartitionRole::Oem => "COS_OEM",
            PartitionRole::Persistent => "COS_PERSISTENT",
        }
    }

    pub(crate) fn default_mountpoint(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("/run/snapos/{}", self.name()))
    }

    pub(crate) fn default_fs(&self) -> &'static str {
        match self {
            PartitionRole::Efi => "vfat",
            _ => "ext4",
        }
    }
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A physical partition and where we mount it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Partition {
    pub(crate) role: PartitionRole,
    pub(crate) label: String,
    pub(crate) device: Option<Utf8PathBuf>,
    pub(crate) mountpoint: Utf8PathBuf,
    pub(crate) fs: String,
    pub(crate) flags: Vec<String>,
}

impl Partition {
    /// A partition with default label, mountpoint and filesystem.
    pub(crate) fn new(role: PartitionRole) -> Self {
        Self {
            role,
            label: role.default_label().to_owned(),
            device: None,
            mountpoint: role.default_mountpoint(),
            fs: role.default_fs().to_owned(),
            flags: Vec::new(),
        }
    }

    fn device(&self) -> Result<&Utf8Path> {
        self.device
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No device found for partition {}", self.label))
    }
}

/// The partitions present on the target disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PartitionSet {
    parts: Vec<Partition>,
}

impl PartitionSet {
    pub(crate) fn new(parts: impl IntoIterator<Item = Partition>) -> Self {
        Self {
            parts: parts.into_iter().collect(),
        }
    }

    /// Look up every role by its label in `devices`. Roles without a
    /// matching device are left undefined.
    pub(crate) fn discover(
        labels: &crate::config::PartitionLabels,
        devices: &[snapos_blockdev::Device],
    ) -> Self {
        let parts = PartitionRole::ALL.into_iter().filter_map(|role| {
            let label = labels.label(role);
            let Some(dev) = snapos_blockdev::find_by_label(devices, label) else {
                tracing::debug!("No partition with label {label} for {role}");
                return None;
            };
            let mut p = Partition::new(role);
            p.label = label.to_owned();
            p.device = Some(dev.path.clone());
            if let Some(fs) = dev.fstype.as_ref() {
                p.fs = fs.clone();
            }
            Some(p)
        });
        Self::new(parts)
    }

    pub(crate) fn get(&self, role: PartitionRole) -> Option<&Partition> {
        self.parts.iter().find(|p| p.role == role)
    }

    pub(crate) fn require(&self, role: PartitionRole) -> Result<&Partition, ActionError> {
        self.get(role)
            .ok_or(ActionError::sentinel(ErrorKind::UndefinedPartition(role)))
    }

    /// Partitions sorted so that parents are mounted before nested
    /// mountpoints; reverse for unmounting.
    pub(crate) fn by_mount_order(&self, exclude: &[PartitionRole]) -> Vec<&Partition> {
        let mut r: Vec<_> = self
            .parts
            .iter()
            .filter(|p| !exclude.contains(&p.role))
            .collect();
        r.sort_by(|a, b| {
            let depth = |p: &Partition| p.mountpoint.components().count();
            depth(a)
                .cmp(&depth(b))
                .then_with(|| a.mountpoint.cmp(&b.mountpoint))
        });
        r
    }
}

/// Mounting and unmounting filesystems.
pub(crate) trait Mounter: fmt::Debug {
    fn mount(&self, device: &str, path: &Utf8Path, fstype: &str, options: &[&str]) -> Result<()>;
    fn unmount(&self, path: &Utf8Path) -> Result<()>;
    fn is_mountpoint(&self, path: &Utf8Path) -> Result<bool>;
}

/// Creating filesystems.
pub(crate) trait Formatter: fmt::Debug {
    fn format(&self, part: &Partition) -> Result<()>;
}

#[derive(Debug, Default)]
pub(crate) struct HostMounter;

impl Mounter for HostMounter {
    fn mount(&self, device: &str, path: &Utf8Path, fstype: &str, options: &[&str]) -> Result<()> {
        match options.split_first() {
            Some((&"remount", rest)) => snapos_mount::remount(path, rest),
            _ => snapos_mount::mount(device, path, Some(fstype), options),
        }
    }

    fn unmount(&self, path: &Utf8Path) -> Result<()> {
        snapos_mount::unmount(path)
    }

    fn is_mountpoint(&self, path: &Utf8Path) -> Result<bool> {
        snapos_mount::is_mountpoint(path)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Mkfs;

impl Formatter for Mkfs {
    #[context("Formatting {}", part.label)]
    fn format(&self, part: &Partition) -> Result<()> {
        let device = part.device()?;
        let mut cmd = Command::new(format!("mkfs.{}", part.fs));
        match part.fs.as_str() {
            "vfat" | "fat" => cmd.args(["-n", &part.label]),
            "ext2" | "ext3" | "ext4" => cmd.args(["-F", "-L", &part.label]),
            "xfs" | "btrfs" => cmd.args(["-f", "-L", &part.label]),
            o => anyhow::bail!("Unsupported filesystem {o}"),
        };
        cmd.args(&part.flags);
        println!("Formatting {} ({}) as {}", part.label, device, part.fs);
        cmd.arg(device.as_str()).log_debug().run_capture_stderr()
    }
}

/// Ensure `part` is mounted read-write and register the matching
/// compensator: remount read-only if it was already mounted, unmount
/// otherwise.
#[context("Mounting {} read-write", part.role)]
pub(crate) fn mount_rw<C: ?Sized>(
    mounter: &Rc<dyn Mounter>,
    part: &Partition,
    cleanup: &mut CleanupStack<'_, C>,
) -> Result<()> {
    let mp = part.mountpoint.clone();
    if mounter.is_mountpoint(&mp)? {
        tracing::debug!("Remounting {mp} read-write");
        mounter.mount("", &mp, "", &["remount", "rw"])?;
        let m = Rc::clone(mounter);
        cleanup.push(format!("remount {mp} ro"), move |_| {
            m.mount("", &mp, "", &["remount", "ro"])
        });
        return Ok(());
    }
    let device = part.device()?;
    std::fs::create_dir_all(&mp).with_context(|| format!("Creating {mp}"))?;
    mounter.mount(device.as_str(), &mp, &part.fs, &["rw"])?;
    let m = Rc::clone(mounter);
    cleanup.push(format!("unmount {mp}"), move |_| m.unmount(&mp));
    Ok(())
}

/// Mount every partition in `parts` that is not already mounted,
/// registering an unmount as soon as each mount succeeds. Partitions
/// found mounted are left alone, now and at cleanup.
#[context("Mounting partitions")]
pub(crate) fn mount_all<C: ?Sized>(
    mounter: &Rc<dyn Mounter>,
    parts: &[&Partition],
    cleanup: &mut CleanupStack<'_, C>,
) -> Result<()> {
    for part in parts {
        let mp = part.mountpoint.clone();
        if mounter.is_mountpoint(&mp)? {
            tracing::debug!("{} already mounted at {mp}", part.label);
            continue;
        }
        let device = part.device()?;
        std::fs::create_dir_all(&mp).with_context(|| format!("Creating {mp}"))?;
        mounter.mount(device.as_str(), &mp, &part.fs, &["rw"])?;
        let m = Rc::clone(mounter);
        cleanup.push(format!("unmount {mp}"), move |_| m.unmount(&mp));
    }
    Ok(())
}

/// Unmount every mounted partition in `parts`, nested mounts first.
#[context("Unmounting partitions")]
pub(crate) fn unmount_all(mounter: &dyn Mounter, parts: &[&Partition]) -> Result<()> {
    for part in parts.iter().rev() {
        if mounter.is_mountpoint(&part.mountpoint)? {
            mounter.unmount(&part.mountpoint)?;
        }
    }
    Ok(())
}
