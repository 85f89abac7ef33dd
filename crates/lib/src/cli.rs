//! # Command line interface
//!
//! Flags given here are applied on top of the configuration files; see
//! [`crate::config`] for where those are read from.

use std::ffi::OsString;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;

use crate::action::{self, ActionContext, BootedSystem, Toolkit};
use crate::config::{RunConfig, load_config};
use crate::error::{ActionError, ErrorKind, WithKind};
use crate::partition::PartitionSet;
use crate::power::PowerAction;
use crate::source::ImageSource;

/// Transactional install, reset and upgrade of an image based OS
#[derive(Debug, Parser)]
#[clap(name = "snapos", version)]
struct Cli {
    /// Configuration file applied after the `snapos/config.d` fragments
    #[clap(long, global = true)]
    config: Option<Utf8PathBuf>,

    /// Abort when a hook fails
    #[clap(long, global = true)]
    strict: bool,

    /// Reboot after a successful run
    #[clap(long, global = true, conflicts_with = "poweroff")]
    reboot: bool,

    /// Power off after a successful run
    #[clap(long, global = true)]
    poweroff: bool,

    /// Enable debug output
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    opt: Opt,
}

#[derive(Debug, clap::Subcommand)]
enum Opt {
    /// Install the system to an already partitioned disk
    Install {
        /// The system image, e.g. `oci://registry.example.com/os:v1` or `dir:///run/rootfs`
        #[clap(long)]
        system: Option<ImageSource>,

        /// The recovery system image; defaults to the installed system
        #[clap(long)]
        recovery_system: Option<ImageSource>,

        /// Keep the existing filesystems
        #[clap(long)]
        no_format: bool,
    },
    /// Redeploy the system, from the recovery image by default
    Reset {
        /// Reset from this image instead of the recovery image
        #[clap(long)]
        system: Option<ImageSource>,

        /// Also wipe the persistent partition
        #[clap(long)]
        format_persistent: bool,

        /// Also wipe the OEM partition
        #[clap(long)]
        format_oem: bool,
    },
    /// Deploy a new system image as a new snapshot
    Upgrade {
        /// The new system image; defaults to the source of the active snapshot
        #[clap(long)]
        system: Option<ImageSource>,

        /// Also upgrade the recovery system
        #[clap(long)]
        recovery: bool,

        /// Image for the recovery system; defaults to the new system
        #[clap(long, requires = "recovery")]
        recovery_system: Option<ImageSource>,
    },
    /// Replace only the recovery system
    UpgradeRecovery {
        /// The new recovery system image
        #[clap(long)]
        recovery_system: Option<ImageSource>,

        /// Record the new recovery image in the install state
        #[clap(long)]
        update_install_state: bool,
    },
    /// Print the recorded install state
    State,
}

fn override_source(target: &mut Option<ImageSource>, value: &Option<ImageSource>) {
    if let Some(v) = value {
        *target = Some(v.clone());
    }
}

impl Cli {
    /// Apply the command line overrides to `config`.
    fn apply(&self, config: &mut RunConfig) {
        config.strict |= self.strict;
        if let Some(power) = PowerAction::from_flags(self.reboot, self.poweroff) {
            config.power = Some(power);
        }
        match &self.opt {
            Opt::Install {
                system,
                recovery_system,
                no_format,
            } => {
                override_source(&mut config.install.system, system);
                override_source(&mut config.install.recovery_system, recovery_system);
                config.install.no_format |= *no_format;
            }
            Opt::Reset {
                system,
                format_persistent,
                format_oem,
            } => {
                override_source(&mut config.reset.system, system);
                config.reset.format_persistent |= *format_persistent;
                config.reset.format_oem |= *format_oem;
            }
            Opt::Upgrade {
                system,
                recovery,
                recovery_system,
            } => {
                override_source(&mut config.upgrade.system, system);
                config.upgrade.recovery |= *recovery;
                override_source(&mut config.upgrade.recovery_system, recovery_system);
            }
            Opt::UpgradeRecovery {
                recovery_system,
                update_install_state,
            } => {
                override_source(&mut config.upgrade_recovery.recovery_system, recovery_system);
                config.upgrade_recovery.update_install_state |= *update_install_state;
            }
            Opt::State => {}
        }
    }
}

fn print_state(cx: &ActionContext<'_>) -> Result<()> {
    let Some(state) = action::read_state(cx)? else {
        println!("# No install state recorded");
        return Ok(());
    };
    // Summary lines are YAML comments so the output stays parseable
    if let Some((id, active)) = state.active_snapshot() {
        println!("# Active snapshot: {id} ({})", active.source);
    }
    if let Some(recovery) = state.recovery_image() {
        println!("# Recovery image: {}", recovery.source);
    }
    print!("{}", state.to_yaml()?);
    Ok(())
}

fn report(e: ActionError) -> anyhow::Error {
    tracing::debug!("Failed with {:?}, exit code {}", e.kind(), e.exit_code());
    e.into()
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure to parse the arguments.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    snapos_utils::initialize_tracing(cli.verbose);

    let mut config = load_config(cli.config.as_deref()).with_kind(ErrorKind::InvalidConfig)?;
    cli.apply(&mut config);
    tracing::debug!("Effective configuration: {config:?}");

    let devices = snapos_blockdev::list_devices().context("Listing block devices")?;
    let parts = PartitionSet::discover(&config.labels, &devices);
    let booted = BootedSystem::detect()?;
    if booted.from_recovery {
        tracing::debug!("Running from the recovery system");
    }
    let toolkit = Toolkit::host();
    let cx = ActionContext {
        config: &config,
        toolkit: &toolkit,
        parts: &parts,
        booted,
    };
    let r = match cli.opt {
        Opt::Install { .. } => action::install(&cx),
        Opt::Reset { .. } => action::reset(&cx),
        Opt::Upgrade { .. } => action::upgrade(&cx),
        Opt::UpgradeRecovery { .. } => action::upgrade_recovery(&cx),
        Opt::State => return print_state(&cx),
    };
    r.map_err(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<RunConfig> {
        let cli = Cli::try_parse_from(std::iter::once("snapos").chain(args.iter().copied()))?;
        let mut config = RunConfig::default();
        cli.apply(&mut config);
        Ok(config)
    }

    #[test]
    fn test_parse_upgrade() -> Result<()> {
        let c = parse(&["upgrade", "--reboot", "--system", "alpine:latest", "--recovery"])?;
        assert_eq!(c.power, Some(PowerAction::Reboot));
        assert_eq!(
            c.upgrade.system.as_ref().map(|s| s.to_string()).as_deref(),
            Some("oci://alpine:latest")
        );
        assert!(c.upgrade.recovery);
        assert!(!c.strict);
        Ok(())
    }

    #[test]
    fn test_parse_global_flags() -> Result<()> {
        let c = parse(&[
            "--strict",
            "--poweroff",
            "upgrade-recovery",
            "--recovery-system",
            "dir:///run/recovery",
            "--update-install-state",
        ])?;
        assert!(c.strict);
        assert_eq!(c.power, Some(PowerAction::PowerOff));
        assert!(c.upgrade_recovery.update_install_state);
        assert_eq!(
            c.upgrade_recovery
                .recovery_system
                .as_ref()
                .map(|s| s.to_string())
                .as_deref(),
            Some("dir:///run/recovery")
        );
        Ok(())
    }

    #[test]
    fn test_config_kept_without_flags() -> Result<()> {
        let mut config = RunConfig::from_toml(indoc::indoc! { r#"
            reboot = true
            [reset]
            format-oem = true
            system = "oci://registry.example.com/os:v1"
        "# })?;
        let cli = Cli::try_parse_from(["snapos", "reset", "--format-persistent"])?;
        cli.apply(&mut config);
        assert_eq!(config.power, Some(PowerAction::Reboot));
        assert!(config.reset.format_oem);
        assert!(config.reset.format_persistent);
        assert_eq!(
            config.reset.system.as_ref().map(|s| s.to_string()).as_deref(),
            Some("oci://registry.example.com/os:v1")
        );
        Ok(())
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse(&["--reboot", "--poweroff", "upgrade"]).is_err());
        assert!(parse(&["upgrade", "--recovery-system", "alpine"]).is_err());
        assert!(parse(&["install", "--system", "ftp://example.com/os"]).is_err());
        assert!(parse(&[]).is_err());
    }

    #[test]
    fn test_clap() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
