//! Typed failures returned by the workflows.
//!
//! Internal code uses [`anyhow`]; every workflow step converts its failure
//! into an [`ActionError`] carrying an [`ErrorKind`] via [`WithKind`]. The
//! kind decides the process exit code.

use std::fmt;

use thiserror::Error;

use crate::hook::HookPhase;
use crate::partition::PartitionRole;
use crate::power::PowerAction;

/// Exit code used for failures that do not carry a kind.
pub const UNKNOWN_EXIT_CODE: i32 = 255;

/// The category of a workflow failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Mounting a single partition failed.
    MountPartition(PartitionRole),
    /// Mounting the whole partition set failed.
    MountPartitions,
    /// Unmounting partitions failed.
    UnmountPartitions,
    /// Formatting a partition failed.
    FormatPartition,
    /// The snapshot storage area could not be prepared.
    SnapshotterInit,
    /// A new snapshot could not be allocated.
    SnapshotterStart,
    /// A snapshot could not be committed.
    SnapshotterClose,
    /// The snapshotter type differs from the one recorded at install time.
    SnapshotterMismatch,
    /// Populating the snapshot tree from the system source failed.
    DeploySource,
    /// Building or deploying an image file failed.
    DeployImage,
    /// Swapping the new recovery image into place failed.
    ReplaceRecovery,
    /// A hook failed in strict mode.
    Hook(HookPhase),
    /// Installing bootloader files failed.
    BootloaderInstall,
    /// Writing bootloader environment variables failed.
    BootloaderVariables,
    /// Setting the default boot entry failed.
    DefaultEntry,
    /// Relabeling the new tree failed.
    SelinuxRelabel,
    /// The install state ledger could not be read.
    LedgerRead,
    /// The install state ledger could not be written.
    LedgerWrite,
    /// A cleanup step failed after an otherwise successful workflow.
    Cleanup,
    /// Rebooting or powering off failed.
    Power(PowerAction),
    /// A partition required by the workflow is not defined.
    UndefinedPartition(PartitionRole),
    /// Upgrading the recovery image from the recovery system itself.
    UpgradeRecoveryFromRecovery,
    /// The configuration is invalid.
    InvalidConfig,
}

impl ErrorKind {
    /// The process exit code for this kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::DeploySource => 18,
            ErrorKind::InvalidConfig => 31,
            ErrorKind::SnapshotterMismatch => 33,
            ErrorKind::MountPartition(PartitionRole::State) => 34,
            ErrorKind::MountPartition(PartitionRole::Recovery) => 35,
            ErrorKind::Hook(HookPhase::BeforeUpgrade) => 36,
            ErrorKind::Hook(HookPhase::AfterUpgrade) => 38,
            ErrorKind::Hook(HookPhase::AfterUpgradeChroot) => 39,
            ErrorKind::ReplaceRecovery => 40,
            ErrorKind::Cleanup => 41,
            ErrorKind::Power(PowerAction::Reboot) => 42,
            ErrorKind::Power(PowerAction::PowerOff) => 43,
            ErrorKind::DefaultEntry => 45,
            ErrorKind::SelinuxRelabel => 46,
            ErrorKind::UndefinedPartition(_) => 47,
            ErrorKind::DeployImage => 48,
            ErrorKind::BootloaderInstall => 49,
            ErrorKind::Hook(HookPhase::BeforeInstall) => 50,
            ErrorKind::Hook(HookPhase::AfterInstall) => 51,
            ErrorKind::Hook(HookPhase::AfterInstallChroot) => 52,
            ErrorKind::MountPartitions | ErrorKind::MountPartition(PartitionRole::Oem) => 54,
            ErrorKind::UnmountPartitions => 59,
            ErrorKind::FormatPartition => 60,
            ErrorKind::Hook(HookPhase::BeforeReset) => 61,
            ErrorKind::Hook(HookPhase::AfterResetChroot) => 62,
            ErrorKind::Hook(HookPhase::AfterReset) => 63,
            ErrorKind::LedgerRead => 67,
            ErrorKind::LedgerWrite => 16,
            ErrorKind::Hook(HookPhase::PostUpgrade) => 72,
            ErrorKind::Hook(HookPhase::PostReset) => 73,
            ErrorKind::Hook(HookPhase::PostInstall) => 74,
            ErrorKind::BootloaderVariables => 78,
            ErrorKind::SnapshotterInit => 84,
            ErrorKind::SnapshotterStart => 85,
            ErrorKind::MountPartition(PartitionRole::Efi) => 86,
            ErrorKind::SnapshotterClose => 87,
            ErrorKind::UpgradeRecoveryFromRecovery => 88,
            ErrorKind::MountPartition(PartitionRole::Persistent) => 89,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::MountPartition(role) => write!(f, "failed mounting the {role} partition"),
            ErrorKind::MountPartitions => f.write_str("failed mounting partitions"),
            ErrorKind::UnmountPartitions => f.write_str("failed unmounting partitions"),
            ErrorKind::FormatPartition => f.write_str("failed formatting partition"),
            ErrorKind::SnapshotterInit => f.write_str("failed initializing snapshotter"),
            ErrorKind::SnapshotterStart => f.write_str("failed starting snapshotter transaction"),
            ErrorKind::SnapshotterClose => f.write_str("failed closing snapshotter transaction"),
            ErrorKind::SnapshotterMismatch => {
                f.write_str("snapshotter type differs from the installed one")
            }
            ErrorKind::DeploySource => f.write_str("failed deploying source"),
            ErrorKind::DeployImage => f.write_str("failed deploying image"),
            ErrorKind::ReplaceRecovery => f.write_str("failed replacing recovery image"),
            ErrorKind::Hook(phase) => write!(f, "hook {phase} failed"),
            ErrorKind::BootloaderInstall => f.write_str("failed installing bootloader"),
            ErrorKind::BootloaderVariables => f.write_str("failed setting bootloader variables"),
            ErrorKind::DefaultEntry => f.write_str("failed setting default boot entry"),
            ErrorKind::SelinuxRelabel => f.write_str("failed applying SELinux labels"),
            ErrorKind::LedgerRead => f.write_str("failed reading install state"),
            ErrorKind::LedgerWrite => f.write_str("failed writing install state"),
            ErrorKind::Cleanup => f.write_str("cleanup failed"),
            ErrorKind::Power(PowerAction::Reboot) => f.write_str("failed rebooting"),
            ErrorKind::Power(PowerAction::PowerOff) => f.write_str("failed powering off"),
            ErrorKind::UndefinedPartition(role) => write!(f, "undefined {role} partition"),
            ErrorKind::UpgradeRecoveryFromRecovery => {
                f.write_str("can not upgrade the recovery image from the recovery system")
            }
            ErrorKind::InvalidConfig => f.write_str("invalid configuration"),
        }
    }
}

/// A workflow failure: a kind plus the underlying cause, if any.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct ActionError {
    kind: ErrorKind,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ActionError {
    /// Wrap `source` with `kind`.
    pub fn new(kind: ErrorKind, source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            source: Some(source.into().into()),
        }
    }

    /// A failure with no underlying cause.
    pub fn sentinel(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    /// The kind of this failure.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }
}

impl From<ErrorKind> for ActionError {
    fn from(kind: ErrorKind) -> Self {
        Self::sentinel(kind)
    }
}

/// Attach an [`ErrorKind`] to a failure.
pub(crate) trait WithKind<T> {
    fn with_kind(self, kind: ErrorKind) -> Result<T, ActionError>;
}

impl<T> WithKind<T> for anyhow::Result<T> {
    fn with_kind(self, kind: ErrorKind) -> Result<T, ActionError> {
        self.map_err(|e| ActionError::new(kind, e))
    }
}

/// Map any error to a process exit code.
pub fn exit_code_of(e: &anyhow::Error) -> i32 {
    e.downcast_ref::<ActionError>()
        .map(|e| e.exit_code())
        .unwrap_or(UNKNOWN_EXIT_CODE)
}
