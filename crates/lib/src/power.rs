//! Rebooting or powering off once a workflow finished.

use std::fmt;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use snapos_utils::CommandRunExt;

/// The grace period before the power action.
pub(crate) const POWER_DELAY: Duration = Duration::from_secs(5);

/// What to do with the machine at the end of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    /// Restart the system.
    Reboot,
    /// Shut the system down.
    PowerOff,
}

impl PowerAction {
    /// Pick the action requested by the flags; reboot wins over poweroff.
    pub(crate) fn from_flags(reboot: bool, poweroff: bool) -> Option<Self> {
        match (reboot, poweroff) {
            (true, _) => Some(PowerAction::Reboot),
            (false, true) => Some(PowerAction::PowerOff),
            (false, false) => None,
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerAction::Reboot => f.write_str("reboot"),
            PowerAction::PowerOff => f.write_str("poweroff"),
        }
    }
}

pub(crate) trait PowerControl: fmt::Debug {
    fn reboot(&self, delay: Duration) -> Result<()>;
    fn shutdown(&self, delay: Duration) -> Result<()>;
}

impl PowerAction {
    /// Perform the action after [`POWER_DELAY`].
    pub(crate) fn run(self, power: &dyn PowerControl) -> Result<()> {
        match self {
            PowerAction::Reboot => power.reboot(POWER_DELAY),
            PowerAction::PowerOff => power.shutdown(POWER_DELAY),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct HostPower;

impl HostPower {
    fn exec(cmd: &str, delay: Duration) -> Result<()> {
        println!("{cmd} in {} seconds", delay.as_secs());
        std::thread::sleep(delay);
        Command::new(cmd).arg("-f").log_debug().run_capture_stderr()
    }
}

impl PowerControl for HostPower {
    fn reboot(&self, delay: Duration) -> Result<()> {
        Self::exec("reboot", delay)
    }

    fn shutdown(&self, delay: Duration) -> Result<()> {
        Self::exec("poweroff", delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_flags() {
        assert_eq!(PowerAction::from_flags(true, true), Some(PowerAction::Reboot));
        assert_eq!(
            PowerAction::from_flags(false, true),
            Some(PowerAction::PowerOff)
        );
        assert_eq!(PowerAction::from_flags(false, false), None);
    }
}
