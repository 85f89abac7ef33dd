//! Block device probing based on `lsblk --json`.

use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;
use serde::Deserialize;
use snapos_utils::CommandRunExt;

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// Sizes are numbers with `--bytes` on recent util-linux but strings on older ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Size {
    Number(u64),
    Text(String),
}

fn deserialize_size<'de, D>(d: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<Size>::deserialize(d)? {
        None => Ok(0),
        Some(Size::Number(n)) => Ok(n),
        Some(Size::Text(s)) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// A block device or partition as reported by `lsblk`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Device {
    /// Kernel name, e.g. `vda2`
    pub name: String,
    /// Device node, e.g. `/dev/vda2`
    pub path: Utf8PathBuf,
    /// Filesystem label
    pub label: Option<String>,
    /// Filesystem type
    pub fstype: Option<String>,
    /// Where the filesystem is currently mounted, if anywhere
    pub mountpoint: Option<Utf8PathBuf>,
    /// Size in bytes
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: u64,
    /// Partitions or holders of this device
    #[serde(default)]
    pub children: Vec<Device>,
}

impl Device {
    /// This device followed by all its descendants, depth first.
    pub fn iter_all(&self) -> Box<dyn Iterator<Item = &Device> + '_> {
        Box::new(std::iter::once(self).chain(self.children.iter().flat_map(|c| c.iter_all())))
    }
}

/// Parse the output of `lsblk --json`.
pub fn parse_lsblk(buf: &str) -> Result<Vec<Device>> {
    let out: DevicesOutput = serde_json::from_str(buf).context("Parsing lsblk output")?;
    Ok(out.blockdevices)
}

/// List all block devices on the system.
#[context("Listing block devices")]
pub fn list_devices() -> Result<Vec<Device>> {
    let buf = Command::new("lsblk")
        .args([
            "--json",
            "--bytes",
            "--output",
            "NAME,PATH,LABEL,FSTYPE,MOUNTPOINT,SIZE",
        ])
        .log_debug()
        .run_get_string()?;
    parse_lsblk(&buf)
}

/// Find the first device carrying the filesystem label `label`.
pub fn find_by_label<'a>(devices: &'a [Device], label: &str) -> Option<&'a Device> {
    let r = devices
        .iter()
        .flat_map(|d| d.iter_all())
        .find(|d| d.label.as_deref() == Some(label));
    tracing::trace!("Device with label {label}: {:?}", r.map(|d| &d.path));
    r
}
