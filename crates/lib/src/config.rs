//! # Runtime configuration
//!
//! Configuration is read from TOML fragments in `snapos/config.d` under
//! the usual systemd bases (e.g. `/etc/snapos/config.d/10-site.toml`).
//! Later fragments override earlier ones; command line flags are applied
//! last. The result is a [`RunConfig`] that never changes afterwards.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::partition::PartitionRole;
use crate::power::PowerAction;
use crate::snapshotter::{KINDS, LoopDeviceConfig, SnapshotterConfig};
use crate::source::ImageSource;

const SYSTEMD_CONVENTIONAL_BASES: &[&str] = &["/usr/lib", "/usr/local/lib", "/etc", "/run"];
const CONFIG_DIR: &str = "snapos/config.d";

/// Default size of the recovery image when it is not a squashfs, in MiB.
const DEFAULT_RECOVERY_SIZE: u64 = 4096;
const DEFAULT_RECOVERY_FS: &str = "squashfs";
const DEFAULT_CLOUD_INIT_PATHS: &[&str] = &["/system/oem", "/oem", "/usr/local/cloud-config"];

fn merge_basic<T>(s: &mut Option<T>, o: Option<T>) {
    if let Some(o) = o {
        *s = Some(o);
    }
}

trait Mergeable {
    fn merge(&mut self, other: Self)
    where
        Self: Sized;
}

impl<T> Mergeable for Option<T>
where
    T: Mergeable,
{
    fn merge(&mut self, other: Self)
    where
        Self: Sized,
    {
        if let Some(other) = other {
            if let Some(s) = self.as_mut() {
                s.merge(other)
            } else {
                *self = Some(other);
            }
        }
    }
}

/// Filesystem labels of the managed partitions; unset ones use the
/// defaults of [`PartitionRole`].
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub(crate) struct PartitionLabels {
    pub(crate) efi: Option<String>,
    pub(crate) state: Option<String>,
    pub(crate) recovery: Option<String>,
    pub(crate) oem: Option<String>,
    pub(crate) persistent: Option<String>,
}

impl PartitionLabels {
    pub(crate) fn label(&self, role: PartitionRole) -> &str {
        let v = match role {
            PartitionRole::Efi => &self.efi,
            PartitionRole::State => &self.state,
            PartitionRole::Recovery => &self.recovery,
            PartitionRole::Oem => &self.oem,
            PartitionRole::Persistent => &self.persistent,
        };
        v.as_deref().unwrap_or(role.default_label())
    }
}

impl Mergeable for PartitionLabels {
    fn merge(&mut self, other: Self) {
        merge_basic(&mut self.efi, other.efi);
        merge_basic(&mut self.state, other.state);
        merge_basic(&mut self.recovery, other.recovery);
        merge_basic(&mut self.oem, other.oem);
        merge_basic(&mut self.persistent, other.persistent);
    }
}

/// The serialized `[snapshotter.config]` section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct LoopDeviceSection {
    size: Option<u64>,
    fs: Option<String>,
}

impl Mergeable for LoopDeviceSection {
    fn merge(&mut self, other: Self) {
        merge_basic(&mut self.size, other.size);
        merge_basic(&mut self.fs, other.fs);
    }
}

/// The serialized `[snapshotter]` section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct SnapshotterSection {
    #[serde(rename = "type")]
    kind: Option<String>,
    max_snaps: Option<u32>,
    config: Option<LoopDeviceSection>,
}

impl Mergeable for SnapshotterSection {
    fn merge(&mut self, other: Self) {
        merge_basic(&mut self.kind, other.kind);
        merge_basic(&mut self.max_snaps, other.max_snaps);
        self.config.merge(other.config);
    }
}

/// The serialized `[recovery]` section: how recovery images are built.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RecoverySection {
    fs: Option<String>,
    size: Option<u64>,
}

impl Mergeable for RecoverySection {
    fn merge(&mut self, other: Self) {
        merge_basic(&mut self.fs, other.fs);
        merge_basic(&mut self.size, other.size);
    }
}

/// The serialized `[install]` section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct InstallSection {
    system: Option<ImageSource>,
    recovery_system: Option<ImageSource>,
    no_format: Option<bool>,
}

impl Mergeable for InstallSection {
    fn merge(&mut self, other: Self) {
        merge_basic(&mut self.system, other.system);
        merge_basic(&mut self.recovery_system, other.recovery_system);
        merge_basic(&mut self.no_format, other.no_format);
    }
}

/// The serialized `[reset]` section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct ResetSection {
    system: Option<ImageSource>,
    format_persistent: Option<bool>,
    format_oem: Option<bool>,
}

impl Mergeable for ResetSection {
    fn merge(&mut self, other: Self) {
        merge_basic(&mut self.system, other.system);
        merge_basic(&mut self.format_persistent, other.format_persistent);
        merge_basic(&mut self.format_oem, other.format_oem);
    }
}

/// The serialized `[upgrade]` section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct UpgradeSection {
    system: Option<ImageSource>,
    recovery: Option<bool>,
    recovery_system: Option<ImageSource>,
}

impl Mergeable for UpgradeSection {
    fn merge(&mut self, other: Self) {
        merge_basic(&mut self.system, other.system);
        merge_basic(&mut self.recovery, other.recovery);
        merge_basic(&mut self.recovery_system, other.recovery_system);
    }
}

/// The serialized `[upgrade-recovery]` section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct UpgradeRecoverySection {
    recovery_system: Option<ImageSource>,
    update_install_state: Option<bool>,
}

impl Mergeable for UpgradeRecoverySection {
    fn merge(&mut self, other: Self) {
        merge_basic(&mut self.recovery_system, other.recovery_system);
        merge_basic(&mut self.update_install_state, other.update_install_state);
    }
}

/// A whole configuration fragment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct ConfigFragment {
    strict: Option<bool>,
    reboot: Option<bool>,
    poweroff: Option<bool>,
    cloud_init_paths: Option<Vec<Utf8PathBuf>>,
    grub_default_entry: Option<String>,
    snapshotter: Option<SnapshotterSection>,
    partitions: Option<PartitionLabels>,
    recovery: Option<RecoverySection>,
    install: Option<InstallSection>,
    reset: Option<ResetSection>,
    upgrade: Option<UpgradeSection>,
    upgrade_recovery: Option<UpgradeRecoverySection>,
}

impl Mergeable for ConfigFragment {
    fn merge(&mut self, other: Self) {
        merge_basic(&mut self.strict, other.strict);
        merge_basic(&mut self.reboot, other.reboot);
        merge_basic(&mut self.poweroff, other.poweroff);
        merge_basic(&mut self.cloud_init_paths, other.cloud_init_paths);
        merge_basic(&mut self.grub_default_entry, other.grub_default_entry);
        self.snapshotter.merge(other.snapshotter);
        self.partitions.merge(other.partitions);
        self.recovery.merge(other.recovery);
        self.install.merge(other.install);
        self.reset.merge(other.reset);
        self.upgrade.merge(other.upgrade);
        self.upgrade_recovery.merge(other.upgrade_recovery);
    }
}

/// How recovery images are built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecoveryImageConfig {
    pub(crate) fs: String,
    pub(crate) size_mib: u64,
}

/// Settings for `install`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct InstallConfig {
    pub(crate) system: Option<ImageSource>,
    /// Unset means reusing the system image.
    pub(crate) recovery_system: Option<ImageSource>,
    pub(crate) no_format: bool,
}

/// Settings for `reset`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ResetConfig {
    /// Unset means resetting from the recovery image.
    pub(crate) system: Option<ImageSource>,
    pub(crate) format_persistent: bool,
    pub(crate) format_oem: bool,
}

/// Settings for `upgrade`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct UpgradeConfig {
    pub(crate) system: Option<ImageSource>,
    /// Also upgrade the recovery image.
    pub(crate) recovery: bool,
    /// Unset means reusing the new system snapshot.
    pub(crate) recovery_system: Option<ImageSource>,
}

/// Settings for `upgrade-recovery`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct UpgradeRecoveryConfig {
    pub(crate) recovery_system: Option<ImageSource>,
    pub(crate) update_install_state: bool,
}

/// The effective configuration of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Hook failures abort the workflow.
    pub(crate) strict: bool,
    pub(crate) power: Option<PowerAction>,
    pub(crate) cloud_init_paths: Vec<Utf8PathBuf>,
    pub(crate) grub_default_entry: Option<String>,
    pub(crate) snapshotter: SnapshotterConfig,
    pub(crate) labels: PartitionLabels,
    pub(crate) recovery: RecoveryImageConfig,
    pub(crate) install: InstallConfig,
    pub(crate) reset: ResetConfig,
    pub(crate) upgrade: UpgradeConfig,
    pub(crate) upgrade_recovery: UpgradeRecoveryConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            strict: false,
            power: None,
            cloud_init_paths: DEFAULT_CLOUD_INIT_PATHS
                .iter()
                .map(|p| Utf8PathBuf::from(*p))
                .collect(),
            grub_default_entry: None,
            snapshotter: SnapshotterConfig::default(),
            labels: PartitionLabels::default(),
            recovery: RecoveryImageConfig {
                fs: DEFAULT_RECOVERY_FS.to_owned(),
                size_mib: DEFAULT_RECOVERY_SIZE,
            },
            install: InstallConfig::default(),
            reset: ResetConfig::default(),
            upgrade: UpgradeConfig::default(),
            upgrade_recovery: UpgradeRecoveryConfig::default(),
        }
    }
}

impl RunConfig {
    fn from_fragment(c: ConfigFragment) -> Result<Self> {
        let mut r = Self::default();
        let d = &r.snapshotter;
        let snap = c.snapshotter.unwrap_or_default();
        let loopcfg = snap.config.unwrap_or_default();
        let snapshotter = SnapshotterConfig {
            kind: snap.kind.unwrap_or_else(|| d.kind.clone()),
            max_snaps: snap.max_snaps.unwrap_or(d.max_snaps),
            config: LoopDeviceConfig {
                size: loopcfg.size.unwrap_or(d.config.size),
                fs: loopcfg.fs.unwrap_or_else(|| d.config.fs.clone()),
            },
        };
        if !KINDS.contains(&snapshotter.kind.as_str()) {
            anyhow::bail!("Unsupported snapshotter type {}", snapshotter.kind);
        }
        if snapshotter.max_snaps == 0 {
            anyhow::bail!("max-snaps must be at least 1");
        }
        r.snapshotter = snapshotter;

        r.strict = c.strict.unwrap_or(r.strict);
        r.power = PowerAction::from_flags(c.reboot.unwrap_or(false), c.poweroff.unwrap_or(false));
        if let Some(paths) = c.cloud_init_paths {
            r.cloud_init_paths = paths;
        }
        r.grub_default_entry = c.grub_default_entry.filter(|v| !v.is_empty());
        r.labels = c.partitions.unwrap_or_default();

        let recovery = c.recovery.unwrap_or_default();
        r.recovery.fs = recovery.fs.unwrap_or(r.recovery.fs);
        r.recovery.size_mib = recovery.size.unwrap_or(r.recovery.size_mib);

        let install = c.install.unwrap_or_default();
        r.install = InstallConfig {
            system: install.system,
            recovery_system: install.recovery_system,
            no_format: install.no_format.unwrap_or(false),
        };
        let reset = c.reset.unwrap_or_default();
        r.reset = ResetConfig {
            system: reset.system,
            format_persistent: reset.format_persistent.unwrap_or(false),
            format_oem: reset.format_oem.unwrap_or(false),
        };
        let upgrade = c.upgrade.unwrap_or_default();
        r.upgrade = UpgradeConfig {
            system: upgrade.system,
            recovery: upgrade.recovery.unwrap_or(false),
            recovery_system: upgrade.recovery_system,
        };
        let ur = c.upgrade_recovery.unwrap_or_default();
        r.upgrade_recovery = UpgradeRecoveryConfig {
            recovery_system: ur.recovery_system,
            update_install_state: ur.update_install_state.unwrap_or(false),
        };
        Ok(r)
    }
}

fn parse_fragment(buf: &str, name: &str) -> Result<ConfigFragment> {
    let mut unused = std::collections::BTreeSet::new();
    let de = toml::Deserializer::parse(buf).with_context(|| format!("Parsing {name}"))?;
    let c: ConfigFragment = serde_ignored::deserialize(de, |path| {
        unused.insert(path.to_string());
    })
    .with_context(|| format!("Parsing {name}"))?;
    for key in unused {
        tracing::warn!("{name}: Unknown key {key}");
    }
    Ok(c)
}

#[context("Loading configuration")]
/// Load the configuration, merging all fragments found and then the
/// explicit `extra` file if given.
pub(crate) fn load_config(extra: Option<&camino::Utf8Path>) -> Result<RunConfig> {
    let fragments = liboverdrop::scan(SYSTEMD_CONVENTIONAL_BASES, CONFIG_DIR, &["toml"], true);
    let mut paths: Vec<_> = fragments.into_values().collect();
    if let Some(extra) = extra {
        paths.push(extra.as_std_path().to_owned());
    }
    let mut config = ConfigFragment::default();
    for path in paths {
        let name = path.display().to_string();
        let buf = std::fs::read_to_string(&path).with_context(|| format!("Reading {name}"))?;
        let c = parse_fragment(&buf, &name)?;
        tracing::debug!("Merging config {name}");
        config.merge(c);
    }
    RunConfig::from_fragment(config)
}
