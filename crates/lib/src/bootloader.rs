use std::collections::BTreeMap;
use std::fmt;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use snapos_utils::CommandRunExt;

/// GRUB environment file on the EFI partition holding our variables.
pub(crate) const GRUB_OEM_ENV: &str = "grub_oem_env";
/// Variable naming the default menu entry.
const DEFAULT_MENU_ENTRY: &str = "default_menu_entry";
/// Key in the deployed tree's os-release overriding the entry name.
const GRUB_ENTRY_NAME: &str = "GRUB_ENTRY_NAME";

/// The removable media fallback path, and our own entry path.
const EFI_PREFIXES: [&str; 2] = ["EFI/BOOT", "EFI/ELEMENTAL"];
const GRUB_CFG: &str = "grub.cfg";
/// GRUB configuration shipped by the image
const TREE_GRUB_CFG: &str = "etc/snapos/bootloader/grub.cfg";
const LEGACY_TREE_GRUB_CFG: &str = "etc/cos/grub.cfg";

/// The bootloader capability used by the workflows.
pub(crate) trait Bootloader: fmt::Debug {
    /// Install bootloader binaries and configuration from `tree`
    /// into the EFI partition mounted at `efi_dir`.
    fn install(&self, tree: &Utf8Path, efi_dir: &Utf8Path) -> Result<()>;
    /// Persist `vars` in the environment file `env_file`.
    fn set_persistent_variables(
        &self,
        env_file: &Utf8Path,
        vars: &BTreeMap<String, String>,
    ) -> Result<()>;
    /// Set the default menu entry in the environment on the partition
    /// mounted at `part_mountpoint`, preferring the name shipped in `tree`.
    fn set_default_entry(
        &self,
        part_mountpoint: &Utf8Path,
        tree: &Utf8Path,
        default_entry: Option<&str>,
    ) -> Result<()>;
}

/// Name of the fallback EFI binary for the running architecture.
fn fallback_efi_name() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "bootaa64.efi",
        "riscv64" => "bootriscv64.efi",
        _ => "bootx64.efi",
    }
}

/// Places where images ship the GRUB EFI binary.
fn grub_efi_candidates() -> Vec<Utf8PathBuf> {
    let arch = std::env::consts::ARCH;
    vec![
        format!("usr/share/efi/{arch}/grub.efi").into(),
        format!("usr/share/grub2/{arch}-efi/grub.efi").into(),
        format!("usr/lib/grub/{arch}-efi/monolithic/grub{}.efi", efi_arch_suffix()).into(),
    ]
}

fn efi_arch_suffix() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "aa64",
        "riscv64" => "riscv64",
        _ => "x64",
    }
}

/// Parse an os-release style file into key/value pairs.
pub(crate) fn parse_os_release(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .filter_map(|(k, v)| {
            let v = shlex::split(v)?.join(" ");
            Some((k.trim().to_owned(), v))
        })
        .collect()
}

/// The entry name to set: `GRUB_ENTRY_NAME` from the tree wins over the
/// configured default; empty values count as unset.
fn resolve_default_entry(os_release: Option<&str>, default_entry: Option<&str>) -> Option<String> {
    os_release
        .and_then(|c| parse_os_release(c).remove(GRUB_ENTRY_NAME))
        .filter(|v| !v.is_empty())
        .or_else(|| default_entry.filter(|v| !v.is_empty()).map(ToOwned::to_owned))
}

#[derive(Debug, Default)]
pub(crate) struct Grub;

impl Grub {
    fn editenv() -> Result<&'static str> {
        if snapos_utils::have_executable("grub2-editenv")? {
            Ok("grub2-editenv")
        } else {
            Ok("grub-editenv")
        }
    }

    #[context("Installing GRUB configuration")]
    fn install_config(tree: &Utf8Path, efi_dir: &Utf8Path) -> Result<()> {
        let mut src = tree.join(TREE_GRUB_CFG);
        if !src.try_exists()? {
            src = tree.join(LEGACY_TREE_GRUB_CFG);
            tracing::warn!("GRUB config not found, using legacy config {src}");
        }
        for prefix in EFI_PREFIXES {
            let dest = efi_dir.join(prefix).join(GRUB_CFG);
            tracing::debug!("Copying {src} to {dest}");
            std::fs::copy(&src, &dest).with_context(|| format!("Copying {src} to {dest}"))?;
        }
        Ok(())
    }
}

impl Bootloader for Grub {
    #[context("Installing GRUB from {tree} into {efi_dir}")]
    fn install(&self, tree: &Utf8Path, efi_dir: &Utf8Path) -> Result<()> {
        let mut found = None;
        for candidate in grub_efi_candidates() {
            let p = tree.join(candidate);
            if p.try_exists()? {
                found = Some(p);
                break;
            }
        }
        let Some(grub_efi) = found else {
            anyhow::bail!("No GRUB EFI binary found in {tree}");
        };
        println!("Installing GRUB to {efi_dir}");
        for prefix in EFI_PREFIXES {
            let dir = efi_dir.join(prefix);
            std::fs::create_dir_all(&dir).with_context(|| format!("Creating {dir}"))?;
            let name = if prefix == EFI_PREFIXES[0] {
                fallback_efi_name()
            } else {
                grub_efi.file_name().unwrap_or("grub.efi")
            };
            let dest = dir.join(name);
            tracing::debug!("Copying {grub_efi} to {dest}");
            std::fs::copy(&grub_efi, &dest)
                .with_context(|| format!("Copying {grub_efi} to {dest}"))?;
        }
        Self::install_config(tree, efi_dir)
    }

    #[context("Setting GRUB variables in {env_file}")]
    fn set_persistent_variables(
        &self,
        env_file: &Utf8Path,
        vars: &BTreeMap<String, String>,
    ) -> Result<()> {
        let editenv = Self::editenv()?;
        for (k, v) in vars {
            Command::new(editenv)
                .arg(env_file.as_str())
                .arg("set")
                .arg(format!("{k}={v}"))
                .log_debug()
                .run_capture_stderr()?;
        }
        Ok(())
    }

    #[context("Setting default GRUB entry")]
    fn set_default_entry(
        &self,
        part_mountpoint: &Utf8Path,
        tree: &Utf8Path,
        default_entry: Option<&str>,
    ) -> Result<()> {
        let os_release = tree.join("etc/os-release");
        tracing::debug!("Looking for {GRUB_ENTRY_NAME} in {os_release}");
        let contents = match std::fs::read_to_string(&os_release) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!("Could not load {os_release}: {e}");
                None
            }
        };
        let Some(entry) = resolve_default_entry(contents.as_deref(), default_entry) else {
            tracing::warn!("No default entry name for GRUB, not setting a name");
            return Ok(());
        };
        tracing::info!("Setting default GRUB entry to {entry}");
        let vars = BTreeMap::from([(DEFAULT_MENU_ENTRY.to_owned(), entry)]);
        self.set_persistent_variables(&part_mountpoint.join(GRUB_OEM_ENV), &vars)
    }
}
