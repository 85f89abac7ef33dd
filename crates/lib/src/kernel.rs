//! Kernel detection in deployed trees.
//!
//! The recovery system boots a kernel and initrd copied out of the
//! recovery tree. Images either ship them directly in `/boot`, or only in
//! `/usr/lib/modules/<version>`.

use anyhow::Result;
use camino::Utf8PathBuf;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;

const MODULES_DIR: &str = "usr/lib/modules";
/// Kernel names looked up in `/boot`, in order
const BOOT_KERNELS: &[&str] = &["vmlinuz", "Image", "linux"];
/// Initrd names looked up next to the kernel, in order
const INITRDS: &[&str] = &["initrd", "initramfs.img", "initrd.img"];

/// Paths of the kernel pieces, relative to the tree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Kernel {
    /// The `/usr/lib/modules` version, when known.
    pub(crate) version: Option<String>,
    pub(crate) vmlinuz: Utf8PathBuf,
    pub(crate) initrd: Utf8PathBuf,
}

fn find_initrd(root: &Dir, dir: &str) -> Result<Option<Utf8PathBuf>> {
    for name in INITRDS {
        let p = Utf8PathBuf::from(format!("{dir}/{name}"));
        if root.try_exists(&p)? {
            return Ok(Some(p));
        }
    }
    Ok(None)
}

/// Returns the single `/usr/lib/modules/<version>` directory with a kernel.
fn find_modules_version(root: &Dir) -> Result<Option<String>> {
    let Some(modules) = root.open_dir_optional(MODULES_DIR)? else {
        return Ok(None);
    };
    let mut versions = Vec::new();
    for entry in modules.entries_utf8()? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name()?;
        if modules.try_exists(format!("{name}/vmlinuz"))? {
            versions.push(name);
        }
    }
    match versions.len() {
        0 => Ok(None),
        1 => Ok(versions.pop()),
        _ => anyhow::bail!("Found multiple kernels in {MODULES_DIR}: {}", versions.join(", ")),
    }
}

/// Find the kernel and initrd in a tree. Returns `None` if the tree has
/// no kernel at all; a kernel without initrd is an error.
pub(crate) fn find_kernel(root: &Dir) -> Result<Option<Kernel>> {
    for name in BOOT_KERNELS {
        let vmlinuz = Utf8PathBuf::from(format!("boot/{name}"));
        if !root.try_exists(&vmlinuz)? {
            continue;
        }
        let Some(initrd) = find_initrd(root, "boot")? else {
            anyhow::bail!("Found {vmlinuz} but no initrd");
        };
        return Ok(Some(Kernel {
            version: find_modules_version(root)?,
            vmlinuz,
            initrd,
        }));
    }

    let Some(version) = find_modules_version(root)? else {
        return Ok(None);
    };
    let dir = format!("{MODULES_DIR}/{version}");
    let Some(initrd) = find_initrd(root, &dir)? else {
        anyhow::bail!("Found kernel {version} but no initrd");
    };
    Ok(Some(Kernel {
        vmlinuz: format!("{dir}/vmlinuz").into(),
        initrd,
        version: Some(version),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::{cap_std, cap_tempfile};

    #[test]
    fn test_find_kernel_none() -> Result<()> {
        let tempdir = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        assert!(find_kernel(&tempdir)?.is_none());
        Ok(())
    }

    #[test]
    fn test_find_kernel_boot() -> Result<()> {
        let tempdir = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        tempdir.create_dir_all("boot")?;
        tempdir.atomic_write("boot/vmlinuz", b"fake kernel")?;
        tempdir.atomic_write("boot/initrd", b"fake initrd")?;
        tempdir.create_dir_all("usr/lib/modules/6.12.0-100.fc41.x86_64")?;
        tempdir.atomic_write("usr/lib/modules/6.12.0-100.fc41.x86_64/vmlinuz", b"k")?;

        let k = find_kernel(&tempdir)?.unwrap();
        assert_eq!(k.vmlinuz, "boot/vmlinuz");
        assert_eq!(k.initrd, "boot/initrd");
        assert_eq!(k.version.as_deref(), Some("6.12.0-100.fc41.x86_64"));
        Ok(())
    }

    #[test]
    fn test_find_kernel_modules() -> Result<()> {
        let tempdir = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        tempdir.create_dir_all("usr/lib/modules/6.12.0")?;
        tempdir.atomic_write("usr/lib/modules/6.12.0/vmlinuz", b"fake kernel")?;
        assert!(find_kernel(&tempdir).is_err());

        tempdir.atomic_write("usr/lib/modules/6.12.0/initramfs.img", b"fake initrd")?;
        let k = find_kernel(&tempdir)?.unwrap();
        assert_eq!(k.vmlinuz, "usr/lib/modules/6.12.0/vmlinuz");
        assert_eq!(k.initrd, "usr/lib/modules/6.12.0/initramfs.img");

        tempdir.create_dir_all("usr/lib/modules/6.13.0")?;
        tempdir.atomic_write("usr/lib/modules/6.13.0/vmlinuz", b"fake kernel")?;
        assert!(find_kernel(&tempdir).is_err());
        Ok(())
    }
}
