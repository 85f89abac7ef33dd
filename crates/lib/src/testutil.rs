//! In-memory doubles of the collaborator traits.
//!
//! Each fake is cheap to clone; clones share state so a test can keep a
//! handle for inspection after moving one into a [`Toolkit`].

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::action::Toolkit;
use crate::bootloader::Bootloader;
use crate::deploy::Deployer;
use crate::hook::{Binds, HookPhase, HookRunner};
use crate::image::{ImageMaker, ImageSpec};
use crate::partition::{Formatter, Mounter, Partition, PartitionRole, PartitionSet};
use crate::power::PowerControl;
use crate::snapshotter::{BtrfsTool, Subvolume};
use crate::source::{ImageSource, SourceKind};
use crate::state::{INSTALL_STATE_FILE, InstallState, load_install_state};

/// File written by [`FakeDeployer`] holding the deployed source string.
pub(crate) const SOURCE_MARKER: &str = "source.txt";

#[derive(Debug, Default)]
struct MounterState {
    mounted: BTreeSet<Utf8PathBuf>,
    calls: Vec<String>,
    fail_unmount: bool,
    fail_mount: BTreeSet<Utf8PathBuf>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct FakeMounter(Rc<RefCell<MounterState>>);

impl FakeMounter {
    pub(crate) fn set_mounted(&self, path: &Utf8Path) {
        self.0.borrow_mut().mounted.insert(path.to_owned());
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.0.borrow().calls.clone()
    }

    pub(crate) fn fail_unmount(&self, v: bool) {
        self.0.borrow_mut().fail_unmount = v;
    }

    /// Make mounting at `path` fail.
    pub(crate) fn fail_mount(&self, path: &Utf8Path) {
        self.0.borrow_mut().fail_mount.insert(path.to_owned());
    }
}

impl Mounter for FakeMounter {
    fn mount(&self, device: &str, path: &Utf8Path, fstype: &str, options: &[&str]) -> Result<()> {
        let mut s = self.0.borrow_mut();
        let opts = options.join(",");
        let rest: Vec<&str> = [fstype, opts.as_str()]
            .into_iter()
            .filter(|v| !v.is_empty())
            .collect();
        s.calls
            .push(format!("mount {device} {path} {}", rest.join(" ")));
        if s.fail_mount.contains(path) {
            anyhow::bail!("mounting {path}: no such device");
        }
        if options.first() != Some(&"remount") {
            s.mounted.insert(path.to_owned());
        }
        Ok(())
    }

    fn unmount(&self, path: &Utf8Path) -> Result<()> {
        let mut s = self.0.borrow_mut();
        s.calls.push(format!("unmount {path}"));
        if s.fail_unmount {
            anyhow::bail!("target is busy");
        }
        s.mounted.remove(path);
        Ok(())
    }

    fn is_mountpoint(&self, path: &Utf8Path) -> Result<bool> {
        Ok(self.0.borrow().mounted.contains(path))
    }
}

/// Formatting wipes the content of the partition mountpoint.
#[derive(Debug, Default, Clone)]
pub(crate) struct FakeFormatter(Rc<RefCell<Vec<String>>>);

impl FakeFormatter {
    pub(crate) fn formatted(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

impl Formatter for FakeFormatter {
    fn format(&self, part: &Partition) -> Result<()> {
        if part.mountpoint.exists() {
            std::fs::remove_dir_all(&part.mountpoint)?;
            std::fs::create_dir_all(&part.mountpoint)?;
        }
        self.0.borrow_mut().push(part.label.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BootloaderState {
    vars: BTreeMap<Utf8PathBuf, BTreeMap<String, String>>,
    installs: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    fail_install: bool,
    fail_variables: bool,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct FakeBootloader(Rc<RefCell<BootloaderState>>);

impl FakeBootloader {
    /// Every variable set so far in `env_file`.
    pub(crate) fn vars(&self, env_file: &Utf8Path) -> BTreeMap<String, String> {
        self.0
            .borrow()
            .vars
            .get(env_file)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn installs(&self) -> Vec<(Utf8PathBuf, Utf8PathBuf)> {
        self.0.borrow().installs.clone()
    }

    pub(crate) fn fail_install(&self, v: bool) {
        self.0.borrow_mut().fail_install = v;
    }

    pub(crate) fn fail_variables(&self, v: bool) {
        self.0.borrow_mut().fail_variables = v;
    }
}

impl Bootloader for FakeBootloader {
    fn install(&self, tree: &Utf8Path, efi_dir: &Utf8Path) -> Result<()> {
        let mut s = self.0.borrow_mut();
        if s.fail_install {
            anyhow::bail!("grub install failed");
        }
        s.installs.push((tree.to_owned(), efi_dir.to_owned()));
        Ok(())
    }

    fn set_persistent_variables(
        &self,
        env_file: &Utf8Path,
        vars: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut s = self.0.borrow_mut();
        if s.fail_variables {
            anyhow::bail!("grub2-editenv failed");
        }
        s.vars
            .entry(env_file.to_owned())
            .or_default()
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn set_default_entry(
        &self,
        part_mountpoint: &Utf8Path,
        _tree: &Utf8Path,
        default_entry: Option<&str>,
    ) -> Result<()> {
        let Some(entry) = default_entry else {
            return Ok(());
        };
        let vars = BTreeMap::from([("default_menu_entry".to_owned(), entry.to_owned())]);
        self.set_persistent_variables(&part_mountpoint.join("grub_oem_env"), &vars)
    }
}

#[derive(Debug, Default)]
struct ImageMakerState {
    images: Vec<(Utf8PathBuf, String)>,
    fail: bool,
    fail_fs: Option<String>,
}

/// Writes the deployed source marker of the tree as the image content.
#[derive(Debug, Default, Clone)]
pub(crate) struct FakeImageMaker(Rc<RefCell<ImageMakerState>>);

impl FakeImageMaker {
    pub(crate) fn images(&self) -> Vec<(Utf8PathBuf, String)> {
        self.0.borrow().images.clone()
    }

    pub(crate) fn fail(&self, v: bool) {
        self.0.borrow_mut().fail = v;
    }

    /// Fail only for images of filesystem `fs`.
    pub(crate) fn fail_fs(&self, fs: &str) {
        self.0.borrow_mut().fail_fs = Some(fs.to_owned());
    }
}

impl ImageMaker for FakeImageMaker {
    fn make(&self, tree: &Utf8Path, target: &Utf8Path, spec: &ImageSpec) -> Result<()> {
        let mut s = self.0.borrow_mut();
        if s.fail || s.fail_fs.as_deref() == Some(spec.fs.as_str()) {
            anyhow::bail!("mksquashfs exited with status 1");
        }
        let content = std::fs::read_to_string(tree.join(SOURCE_MARKER)).unwrap_or_default();
        std::fs::write(target, content)?;
        s.images.push((target.to_owned(), spec.label.clone()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DeployerState {
    deployed: Vec<(Utf8PathBuf, String)>,
    fail: bool,
}

/// Writes a small tree with a kernel, an os-release and the source marker.
#[derive(Debug, Default, Clone)]
pub(crate) struct FakeDeployer(Rc<RefCell<DeployerState>>);

impl FakeDeployer {
    pub(crate) fn deployed(&self) -> Vec<(Utf8PathBuf, String)> {
        self.0.borrow().deployed.clone()
    }

    pub(crate) fn fail(&self, v: bool) {
        self.0.borrow_mut().fail = v;
    }
}

impl Deployer for FakeDeployer {
    fn deploy(&self, target: &Utf8Path, source: &ImageSource) -> Result<Option<String>> {
        let mut s = self.0.borrow_mut();
        if s.fail {
            anyhow::bail!("pulling {source}: manifest unknown");
        }
        std::fs::create_dir_all(target.join("boot"))?;
        std::fs::create_dir_all(target.join("etc"))?;
        std::fs::write(target.join("boot/vmlinuz"), "kernel")?;
        std::fs::write(target.join("boot/initrd"), "initrd")?;
        std::fs::write(target.join("etc/os-release"), "NAME=Test\n")?;
        std::fs::write(target.join(SOURCE_MARKER), source.to_string())?;
        s.deployed.push((target.to_owned(), source.to_string()));
        let digest = match source.kind() {
            SourceKind::Oci(r) => Some(format!("sha256:{}", r.len())),
            _ => None,
        };
        Ok(digest)
    }
}

fn copy_tree(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in src.read_dir_utf8()? {
        let entry = entry?;
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(entry.path(), &to)?;
        } else {
            std::fs::copy(entry.path(), &to)?;
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct BtrfsState {
    /// Subvolume ids by absolute path.
    subvols: BTreeMap<Utf8PathBuf, u64>,
    read_only: BTreeSet<Utf8PathBuf>,
    default: Option<u64>,
    last_id: u64,
    calls: Vec<String>,
    fail_set_default: bool,
}

impl BtrfsState {
    fn require(&self, path: &Utf8Path) -> Result<u64> {
        self.subvols
            .get(path)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("ERROR: {path} is not a subvolume"))
    }

    fn add(&mut self, path: &Utf8Path) -> Result<()> {
        if self.subvols.contains_key(path) {
            anyhow::bail!("ERROR: target path already exists: {path}");
        }
        self.last_id = self.last_id.max(255) + 1;
        self.subvols.insert(path.to_owned(), self.last_id);
        Ok(())
    }
}

/// Subvolumes are plain directories; snapshots copy the tree.
#[derive(Debug, Default, Clone)]
pub(crate) struct FakeBtrfs(Rc<RefCell<BtrfsState>>);

impl FakeBtrfs {
    /// Every modifying operation so far.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.0.borrow().calls.clone()
    }

    pub(crate) fn is_read_only(&self, path: &Utf8Path) -> bool {
        self.0.borrow().read_only.contains(path)
    }

    pub(crate) fn fail_set_default(&self, v: bool) {
        self.0.borrow_mut().fail_set_default = v;
    }
}

impl BtrfsTool for FakeBtrfs {
    fn list(&self, root: &Utf8Path) -> Result<Vec<Subvolume>> {
        let s = self.0.borrow();
        Ok(s.subvols
            .iter()
            .filter_map(|(path, id)| {
                let rel = path.strip_prefix(root).ok()?;
                Some(Subvolume {
                    id: *id,
                    path: rel.to_string(),
                })
            })
            .filter(|s| !s.path.is_empty())
            .collect())
    }

    fn get_default(&self, root: &Utf8Path) -> Result<Option<Subvolume>> {
        let Some(id) = self.0.borrow().default else {
            return Ok(None);
        };
        Ok(self.list(root)?.into_iter().find(|s| s.id == id))
    }

    fn set_default(&self, id: u64, _root: &Utf8Path) -> Result<()> {
        let mut s = self.0.borrow_mut();
        s.calls.push(format!("set-default {id}"));
        if s.fail_set_default {
            anyhow::bail!("ERROR: unable to set default subvolume");
        }
        if id == 5 {
            s.default = None;
        } else if s.subvols.values().any(|v| *v == id) {
            s.default = Some(id);
        } else {
            anyhow::bail!("ERROR: no subvolume with id {id}");
        }
        Ok(())
    }

    fn create(&self, path: &Utf8Path) -> Result<()> {
        let mut s = self.0.borrow_mut();
        s.calls.push(format!("create {path}"));
        s.add(path)?;
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn snapshot(&self, source: &Utf8Path, target: &Utf8Path) -> Result<()> {
        let mut s = self.0.borrow_mut();
        s.calls.push(format!("snapshot {source} {target}"));
        s.require(source)?;
        s.add(target)?;
        copy_tree(source, target)
    }

    fn set_read_only(&self, path: &Utf8Path) -> Result<()> {
        let mut s = self.0.borrow_mut();
        s.calls.push(format!("ro {path}"));
        s.require(path)?;
        s.read_only.insert(path.to_owned());
        Ok(())
    }

    fn delete(&self, path: &Utf8Path) -> Result<()> {
        let mut s = self.0.borrow_mut();
        s.calls.push(format!("delete {path}"));
        let id = s.require(path)?;
        if s.default == Some(id) {
            anyhow::bail!("ERROR: cannot delete the default subvolume {path}");
        }
        s.subvols.remove(path);
        s.read_only.remove(path);
        std::fs::remove_dir_all(path)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct HookState {
    runs: Vec<(HookPhase, bool)>,
    fail: bool,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct FakeHookRunner(Rc<RefCell<HookState>>);

impl FakeHookRunner {
    /// Every run as `(phase, chrooted)`.
    pub(crate) fn runs(&self) -> Vec<(HookPhase, bool)> {
        self.0.borrow().runs.clone()
    }

    pub(crate) fn fail(&self, v: bool) {
        self.0.borrow_mut().fail = v;
    }

    fn record(&self, phase: HookPhase, chroot: bool) -> Result<()> {
        let mut s = self.0.borrow_mut();
        s.runs.push((phase, chroot));
        if s.fail {
            anyhow::bail!("{phase}: step exited with status 1");
        }
        Ok(())
    }
}

impl HookRunner for FakeHookRunner {
    fn run(&self, phase: HookPhase, _strict: bool, _extra_paths: &[Utf8PathBuf]) -> Result<()> {
        self.record(phase, false)
    }

    fn run_chroot(
        &self,
        phase: HookPhase,
        _strict: bool,
        root: &Utf8Path,
        _binds: &Binds,
        _extra_paths: &[Utf8PathBuf],
    ) -> Result<()> {
        assert!(root.is_dir(), "{root}");
        self.record(phase, true)
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct FakePower(Rc<RefCell<Vec<&'static str>>>);

impl FakePower {
    pub(crate) fn actions(&self) -> Vec<&'static str> {
        self.0.borrow().clone()
    }
}

impl PowerControl for FakePower {
    fn reboot(&self, _delay: Duration) -> Result<()> {
        self.0.borrow_mut().push("reboot");
        Ok(())
    }

    fn shutdown(&self, _delay: Duration) -> Result<()> {
        self.0.borrow_mut().push("poweroff");
        Ok(())
    }
}

/// A disk with every partition "mounted" below a temporary directory.
#[derive(Debug)]
pub(crate) struct Harness {
    _td: tempfile::TempDir,
    pub(crate) root: Utf8PathBuf,
    pub(crate) mounter: FakeMounter,
    pub(crate) formatter: FakeFormatter,
    pub(crate) bootloader: FakeBootloader,
    pub(crate) deployer: FakeDeployer,
    pub(crate) maker: FakeImageMaker,
    pub(crate) btrfs: FakeBtrfs,
    pub(crate) hooks: FakeHookRunner,
    pub(crate) power: FakePower,
    pub(crate) parts: PartitionSet,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap().to_owned();
        let parts = PartitionSet::new(PartitionRole::ALL.into_iter().map(|role| {
            let mut p = Partition::new(role);
            p.device = Some(format!("/dev/disk/by-label/{}", p.label).into());
            p.mountpoint = root.join(role.name());
            p
        }));
        Self {
            _td: td,
            root,
            mounter: FakeMounter::default(),
            formatter: FakeFormatter::default(),
            bootloader: FakeBootloader::default(),
            deployer: FakeDeployer::default(),
            maker: FakeImageMaker::default(),
            btrfs: FakeBtrfs::default(),
            hooks: FakeHookRunner::default(),
            power: FakePower::default(),
            parts,
        }
    }

    pub(crate) fn toolkit(&self) -> Toolkit {
        Toolkit {
            mounter: Rc::new(self.mounter.clone()),
            formatter: Rc::new(self.formatter.clone()),
            bootloader: Rc::new(self.bootloader.clone()),
            deployer: Rc::new(self.deployer.clone()),
            image_maker: Rc::new(self.maker.clone()),
            btrfs: Rc::new(self.btrfs.clone()),
            hooks: Rc::new(self.hooks.clone()),
            power: Rc::new(self.power.clone()),
        }
    }

    pub(crate) fn mountpoint(&self, role: PartitionRole) -> Utf8PathBuf {
        self.root.join(role.name())
    }

    /// The ledger on the state partition.
    pub(crate) fn ledger(&self) -> Option<InstallState> {
        let path = self
            .mountpoint(PartitionRole::State)
            .join(INSTALL_STATE_FILE);
        load_install_state(&path).unwrap()
    }

    /// The ledger mirror on the recovery partition.
    pub(crate) fn mirror(&self) -> Option<InstallState> {
        let path = self
            .mountpoint(PartitionRole::Recovery)
            .join(INSTALL_STATE_FILE);
        load_install_state(&path).unwrap()
    }

    /// IDs of the snapshots present in the ledger, with the active flag.
    pub(crate) fn ledger_snapshots(&self) -> Vec<(u32, bool)> {
        self.ledger()
            .and_then(|s| s.partition(PartitionRole::State).cloned())
            .map(|p| p.snapshots.iter().map(|(id, s)| (*id, s.active)).collect())
            .unwrap_or_default()
    }

    /// Snapshot image directories present on the state partition.
    pub(crate) fn snapshot_dirs(&self) -> Vec<u32> {
        let dir = self.mountpoint(PartitionRole::State).join(".snapshots");
        let mut r: Vec<u32> = match dir.read_dir_utf8() {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().parse().ok())
                .collect(),
            Err(_) => Vec::new(),
        };
        r.sort_unstable();
        r
    }
}
