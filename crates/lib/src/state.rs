//! The install state ledger.
//!
//! A YAML document recording, per partition, every snapshot with its
//! source and provenance, plus the current recovery image. It is written
//! to the state partition first and then mirrored to the recovery
//! partition.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std::{ambient_authority, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use chrono::{SecondsFormat, Utc};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::partition::PartitionRole;
use crate::snapshotter::SnapshotterConfig;
use crate::source::ImageSource;

/// File name of the ledger on both partitions.
pub(crate) const INSTALL_STATE_FILE: &str = "state.yaml";

/// The current time in the format used throughout the ledger.
pub(crate) fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// The workflow that produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum FromAction {
    Install,
    Reset,
    Upgrade,
    UpgradeRecovery,
}

impl fmt::Display for FromAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FromAction::Install => "install",
            FromAction::Reset => "reset",
            FromAction::Upgrade => "upgrade",
            FromAction::UpgradeRecovery => "upgrade-recovery",
        };
        f.write_str(s)
    }
}

/// One deployed image: a snapshot or the recovery image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SystemState {
    #[serde(default = "ImageSource::empty")]
    pub(crate) source: ImageSource,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) digest: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub(crate) active: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) fs: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) from_action: Option<FromAction>,
}

impl SystemState {
    /// An entry for `source`, dated `date`, not yet active.
    pub(crate) fn new(source: &ImageSource, from_action: FromAction, date: &str) -> Self {
        // The digest is kept in its own field only
        Self {
            source: source.clone().with_digest(None),
            digest: source.digest().unwrap_or_default().to_owned(),
            active: false,
            label: String::new(),
            fs: String::new(),
            labels: BTreeMap::new(),
            date: date.to_owned(),
            from_action: Some(from_action),
        }
    }

    pub(crate) fn with_image(mut self, label: &str, fs: &str) -> Self {
        self.label = label.to_owned();
        self.fs = fs.to_owned();
        self
    }

    /// The source with its recorded digest attached.
    pub(crate) fn source_with_digest(&self) -> ImageSource {
        let digest = (!self.digest.is_empty()).then(|| self.digest.clone());
        self.source.clone().with_digest(digest)
    }
}

/// Everything recorded about one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PartitionState {
    #[serde(default)]
    pub(crate) label: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) snapshots: BTreeMap<u32, SystemState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) recovery: Option<SystemState>,
}

/// The root ledger document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallState {
    #[serde(default)]
    pub(crate) date: String,
    #[serde(default)]
    pub(crate) snapshotter: SnapshotterConfig,
    #[serde(default)]
    pub(crate) partitions: BTreeMap<String, PartitionState>,
}

/// What to do when the mirror copy can not be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MirrorPolicy {
    Required,
    BestEffort,
}

impl InstallState {
    pub(crate) fn new(snapshotter: SnapshotterConfig, date: &str) -> Self {
        Self {
            date: date.to_owned(),
            snapshotter,
            partitions: BTreeMap::new(),
        }
    }

    fn fill_default_labels(&mut self) {
        for role in [PartitionRole::State, PartitionRole::Recovery] {
            if let Some(p) = self.partitions.get_mut(role.name()) {
                if p.label.is_empty() {
                    p.label = role.default_label().to_owned();
                }
            }
        }
    }

    /// The partition entry for `role`, created with `label` if missing.
    pub(crate) fn partition_mut(&mut self, role: PartitionRole, label: &str) -> &mut PartitionState {
        let p = self.partitions.entry(role.name().to_owned()).or_default();
        if p.label.is_empty() {
            p.label = label.to_owned();
        }
        p
    }

    pub(crate) fn partition(&self, role: PartitionRole) -> Option<&PartitionState> {
        self.partitions.get(role.name())
    }

    /// The active snapshot of the state partition.
    pub(crate) fn active_snapshot(&self) -> Option<(u32, &SystemState)> {
        self.partition(PartitionRole::State)?
            .snapshots
            .iter()
            .find(|(_, s)| s.active)
            .map(|(id, s)| (*id, s))
    }

    /// The recorded recovery image.
    pub(crate) fn recovery_image(&self) -> Option<&SystemState> {
        self.partition(PartitionRole::Recovery)?.recovery.as_ref()
    }

    /// Record `entry` as the new active snapshot `new_id` of the state
    /// partition: every other entry becomes inactive and entries whose
    /// snapshot no longer exists in `existing` are dropped.
    pub(crate) fn reconcile_snapshots(
        &mut self,
        label: &str,
        new_id: u32,
        mut entry: SystemState,
        existing: &[u32],
    ) {
        let part = self.partition_mut(PartitionRole::State, label);
        for (id, s) in part.snapshots.iter_mut() {
            if *id != new_id && s.active {
                tracing::debug!("Snapshot {id} is no longer active");
                s.active = false;
            }
        }
        entry.active = true;
        part.snapshots.insert(new_id, entry);
        part.snapshots.retain(|id, _| {
            let keep = existing.contains(id);
            if !keep {
                tracing::debug!("Dropping ledger entry for deleted snapshot {id}");
            }
            keep
        });
    }

    pub(crate) fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Serializing install state")
    }
}

/// Load the ledger at `path`. A missing file is `None`; an unreadable
/// or corrupt one is an error.
#[context("Loading install state from {path}")]
pub(crate) fn load_install_state(path: &Utf8Path) -> Result<Option<InstallState>> {
    let buf = match std::fs::read_to_string(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut state: InstallState = serde_yaml::from_str(&buf).context("Parsing")?;
    state.fill_default_labels();
    Ok(Some(state))
}

fn write_one(path: &Utf8Path, buf: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    let name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Invalid path {path}"))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .with_context(|| format!("Opening {parent}"))?;
    dir.atomic_write(name, buf)
        .with_context(|| format!("Writing {path}"))
}

/// Write `state` to `primary`, then to `mirror`.
#[context("Writing install state")]
pub(crate) fn write_install_state(
    state: &InstallState,
    primary: &Utf8Path,
    mirror: Option<&Utf8Path>,
    policy: MirrorPolicy,
) -> Result<()> {
    let buf = state.to_yaml()?;
    write_one(primary, &buf)?;
    tracing::debug!("Wrote install state to {primary}");
    let Some(mirror) = mirror else {
        return Ok(());
    };
    match (write_one(mirror, &buf), policy) {
        (Ok(()), _) => {
            tracing::debug!("Wrote install state to {mirror}");
            Ok(())
        }
        (Err(e), MirrorPolicy::BestEffort) => {
            tracing::warn!("Failed mirroring install state: {e:#}");
            Ok(())
        }
        (Err(e), MirrorPolicy::Required) => Err(e),
    }
}
